//! Applying the labelling session to link output.
//!
//! Labels override the linker: a confirmed pair becomes the row's match
//! whatever the linker proposed, and a rejected pair is removed if it is the
//! one the linker kept. Labels are always replayed on the linker's own
//! output, so running the update twice gives the same table.

use super::{read_labels, read_linked, selected_files, Label, CONFIDENCE_COLUMN, ID_REF_COLUMN, IS_MATCH_COLUMN, SCORE_COLUMN};
use crate::constants::{ES_LINKER, REF_SUFFIX, RESULTS_ANALYSIS, UPDATE_RESULTS};
use crate::engine::{Pipeline, RunInfo};
use crate::error::{PipelineError, Result};
use crate::modules::TransformOutput;
use crate::registry::ModuleCategory;
use crate::staging::StagingBuffer;
use crate::table::Table;
use crate::tracker::LogTracker;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{info, instrument};

/// Confidence of a pair confirmed by a user
pub const LABELLED_CONFIDENCE: &str = "1.0000";

/// Rewrite link output according to `labels`, reading reference values from
/// the full `reference`
pub fn apply_labels(output: &Table, reference: &Table, labels: &[Label]) -> anyhow::Result<TransformOutput> {
    let index = |column: &str| {
        output
            .column_index(column)
            .ok_or_else(|| anyhow::anyhow!("link output has no {} column", column))
    };
    let id_ref = index(ID_REF_COLUMN)?;
    let score = index(SCORE_COLUMN)?;
    let confidence = index(CONFIDENCE_COLUMN)?;
    let is_match = index(IS_MATCH_COLUMN)?;
    let ref_columns = reference
        .columns
        .iter()
        .map(|c| index(&format!("{}{}", c, REF_SUFFIX)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if output.rows.iter().any(|row| row.len() != output.columns.len()) {
        anyhow::bail!("link output has ragged rows");
    }

    let mut table = output.clone();
    let (mut confirmed, mut changed, mut rejected, mut ignored) = (0usize, 0usize, 0usize, 0usize);
    for label in labels {
        let (Some(row), Some(ref_values)) = (table.rows.get_mut(label.source_row), reference.rows.get(label.ref_row))
        else {
            ignored += 1;
            continue;
        };
        let ref_id = label.ref_row.to_string();
        let is_current = row[is_match] == "true" && row[id_ref] == ref_id;

        if label.is_match {
            if is_current {
                confirmed += 1;
            } else {
                changed += 1;
                for (&idx, value) in ref_columns.iter().zip(ref_values) {
                    row[idx] = value.clone();
                }
                row[id_ref] = ref_id;
                // The index never scored this pair
                row[score].clear();
            }
            row[confidence] = LABELLED_CONFIDENCE.to_string();
            row[is_match] = "true".to_string();
        } else if is_current {
            rejected += 1;
            for &idx in ref_columns.iter().chain([id_ref, score, confidence].iter()) {
                row[idx].clear();
            }
            row[is_match] = "false".to_string();
        }
    }

    Ok(TransformOutput {
        table,
        details: json!({
            "num_labels": labels.len(),
            "num_confirmed": confirmed,
            "num_changed": changed,
            "num_rejected": rejected,
            "num_ignored": ignored,
        }),
    })
}

impl Pipeline {
    /// Apply the labelling session to the linker output and stage the result
    /// under `(update_results, <source file>)`. The caller commits.
    #[instrument(skip(self), fields(project = %self.project.id()))]
    pub fn update_results(&mut self) -> Result<RunInfo> {
        self.require_link_project()?;
        let (source, reference) = selected_files(&self.project)?;
        let file_name = source.file_name;
        if !self.project.metadata.log.is_written(&file_name, ES_LINKER) {
            return Err(PipelineError::NoWrittenArtifact { file_name });
        }
        let output = self
            .project
            .store()
            .open_table(ES_LINKER, &file_name, self.chunk_size)?
            .materialize()?;
        let reference = read_linked(&self.project, &reference, self.chunk_size)?;
        let labels = read_labels(&self.project, self.lock_policy)?;

        let run = LogTracker::begin(UPDATE_RESULTS, ModuleCategory::Transform, &file_name);
        let timer = Instant::now();
        let updated = match apply_labels(&output, &reference, &labels) {
            Ok(updated) => updated,
            Err(e) => return Err(self.fail_run(run, e)),
        };

        self.buffer = Some(StagingBuffer::loaded(ES_LINKER, &file_name, Table::default()));
        self.pending_runs.clear();
        let run_info = self.finish_run(run, Value::Null, updated.details, updated.table, timer)?;
        info!("Applied {} labels to {}", labels.len(), file_name);
        Ok(run_info)
    }

    /// Summarize the last written link output, measuring its precision
    /// against the labelling session
    #[instrument(skip(self), fields(project = %self.project.id()))]
    pub fn analyze_results(&mut self) -> Result<Value> {
        self.require_link_project()?;
        let (source, _) = selected_files(&self.project)?;
        let key = self.get_last_written(None, Some(&source.file_name), None)?;
        let labels = read_labels(&self.project, self.lock_policy)?;
        self.load(&key.module_name, &key.file_name)?;
        self.infer(RESULTS_ANALYSIS, &json!({ "labels": labels }))
    }
}
