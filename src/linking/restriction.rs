//! Restricting the reference to the rows that look like confirmed matches.
//!
//! Words present in every labelled reference row, and values shared by all
//! of them, are inferred from the labelling session. The reference is then
//! filtered on them before indexing. The restricted table keeps the original
//! row number of each row in [`ID_REF_COLUMN`], so labels and link output
//! keep pointing at rows of the full reference.

use super::{read_labels, read_linked, selected_files, ID_REF_COLUMN};
use crate::constants::{reference_name, INFERRED_CONFIG, INFER_RESTRICTION, INIT, PERFORM_RESTRICTION};
use crate::engine::{Pipeline, RunInfo};
use crate::error::{PipelineError, Result};
use crate::modules::{parse_params, InferModule, TransformModule, TransformOutput};
use crate::staging::StagingBuffer;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, instrument};

/// Words and values every kept reference row must hold, per column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestrictionConfig {
    /// Each word must appear in the column's value
    #[serde(default)]
    pub words: BTreeMap<String, Vec<String>>,
    /// The column's value must equal this one
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    /// Number of labelled matches the restriction was inferred from
    #[serde(default)]
    pub num_matches: usize,
}

impl RestrictionConfig {
    pub fn is_empty(&self) -> bool {
        self.words.values().all(Vec::is_empty) && self.values.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InferRestrictionParams {
    /// Columns to look at; every column when absent
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

/// Infers a [`RestrictionConfig`] from reference rows known to be matches
pub struct InferRestriction;

impl InferModule for InferRestriction {
    fn infer(&self, table: &Table, params: &Value) -> anyhow::Result<Value> {
        let params: InferRestrictionParams = parse_params(params)?;
        if table.is_empty() {
            anyhow::bail!("no matched reference row to infer a restriction from");
        }
        let columns = match params.columns {
            Some(columns) => columns,
            None => table.columns.iter().filter(|c| *c != ID_REF_COLUMN).cloned().collect(),
        };

        let mut config = RestrictionConfig {
            num_matches: table.len(),
            ..RestrictionConfig::default()
        };
        for column in columns {
            let idx = table
                .column_index(&column)
                .ok_or_else(|| anyhow::anyhow!("unknown reference column '{}'", column))?;
            let values: Vec<&str> = table.column_values(idx).collect();

            let words = common_words(&values);
            if !words.is_empty() {
                config.words.insert(column.clone(), words);
            }
            if let Some(value) = common_value(&values) {
                config.values.insert(column, value.to_string());
            }
        }
        Ok(serde_json::to_value(config)?)
    }
}

/// Words, in order of first appearance, contained in every value
fn common_words(values: &[&str]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .iter()
        .flat_map(|v| v.split_whitespace())
        .filter(|word| seen.insert(*word))
        .filter(|word| values.iter().all(|v| v.contains(word)))
        .map(str::to_string)
        .collect()
}

/// The value shared by every row, if it is not blank
fn common_value<'a>(values: &[&'a str]) -> Option<&'a str> {
    let first = *values.first()?;
    if first.trim().is_empty() || values.iter().any(|v| *v != first) {
        return None;
    }
    Some(first)
}

/// Keeps the rows matching every word and value of a [`RestrictionConfig`]
pub struct PerformRestriction;

impl TransformModule for PerformRestriction {
    fn apply(&self, table: &Table, params: &Value) -> anyhow::Result<TransformOutput> {
        let config: RestrictionConfig = parse_params(params)?;
        let index = |column: &String| {
            table
                .column_index(column)
                .ok_or_else(|| anyhow::anyhow!("unknown reference column '{}'", column))
        };
        let mut words = Vec::new();
        for (column, column_words) in &config.words {
            let idx = index(column)?;
            words.extend(column_words.iter().map(|w| (idx, w.as_str())));
        }
        let mut values = Vec::new();
        for (column, value) in &config.values {
            values.push((index(column)?, value.as_str()));
        }

        let rows: Vec<Vec<String>> = table
            .rows
            .iter()
            .filter(|row| {
                let cell = |idx: usize| row.get(idx).map(String::as_str).unwrap_or("");
                words.iter().all(|&(idx, word)| cell(idx).contains(word))
                    && values.iter().all(|&(idx, value)| cell(idx) == value)
            })
            .cloned()
            .collect();

        let details = json!({
            "og_len": table.len(),
            "new_len": rows.len(),
            "has_modifications": !words.is_empty() || !values.is_empty(),
        });
        Ok(TransformOutput {
            table: Table::new(table.columns.clone(), rows),
            details,
        })
    }
}

/// Append the row number of each row as [`ID_REF_COLUMN`]
pub fn with_row_ids(mut table: Table) -> Table {
    table.columns.push(ID_REF_COLUMN.to_string());
    for (i, row) in table.rows.iter_mut().enumerate() {
        row.push(i.to_string());
    }
    table
}

/// Split a restricted reference into its columns and original row numbers
pub fn split_row_ids(mut table: Table) -> Result<(Table, Vec<usize>)> {
    if table.columns.last().map(String::as_str) != Some(ID_REF_COLUMN) {
        return Err(PipelineError::InvalidArgument(format!(
            "restricted reference has no trailing {} column",
            ID_REF_COLUMN
        )));
    }
    table.columns.pop();
    let mut ids = Vec::with_capacity(table.len());
    for row in table.rows.iter_mut() {
        let raw = row.pop().unwrap_or_default();
        let id = raw
            .parse::<usize>()
            .map_err(|_| PipelineError::InvalidArgument(format!("invalid reference row number '{}'", raw)))?;
        ids.push(id);
    }
    Ok((table, ids))
}

impl Pipeline {
    /// Infer a restriction of the reference from the labelled matches. The
    /// result becomes the configuration of `perform_restriction`.
    #[instrument(skip(self, params), fields(project = %self.project.id()))]
    pub fn infer_restriction(&mut self, params: &Value) -> Result<Value> {
        self.require_link_project()?;
        let (_, reference) = selected_files(&self.project)?;
        let table = read_linked(&self.project, &reference, self.chunk_size)?;
        let labels = read_labels(&self.project, self.lock_policy)?;

        let matched: BTreeSet<usize> = labels
            .iter()
            .filter(|l| l.is_match && l.ref_row < table.len())
            .map(|l| l.ref_row)
            .collect();
        if matched.is_empty() {
            return Err(PipelineError::InvalidArgument(
                "label at least one match before inferring a restriction".into(),
            ));
        }
        let matched = Table::new(
            table.columns.clone(),
            matched.into_iter().map(|i| table.rows[i].clone()).collect(),
        );
        self.infer_on(INFER_RESTRICTION, &matched, &reference_name(&reference.file_name), params)
    }

    /// Stage the reference filtered by `params`, or by the inferred
    /// configuration when `params` is null, under
    /// `(perform_restriction, REF__<reference file>)`
    #[instrument(skip(self, params), fields(project = %self.project.id()))]
    pub fn perform_restriction(&mut self, params: &Value) -> Result<RunInfo> {
        self.require_link_project()?;
        let params = if params.is_null() {
            self.project
                .store()
                .read_json::<Value>(PERFORM_RESTRICTION, INFERRED_CONFIG)?
                .ok_or_else(|| PipelineError::artifact_not_found(PERFORM_RESTRICTION, INFERRED_CONFIG))?
        } else {
            params.clone()
        };
        let (_, reference) = selected_files(&self.project)?;
        let table = with_row_ids(read_linked(&self.project, &reference, self.chunk_size)?);
        let file_name = reference_name(&reference.file_name);

        self.buffer = Some(StagingBuffer::loaded(INIT, &file_name, table));
        self.pending_runs.clear();
        let outcome = self.transform(PERFORM_RESTRICTION, &params).map(|(_, run)| run);
        if outcome.is_err() {
            // The staged copy has no written counterpart to fall back on
            self.buffer = None;
        }
        if let Ok(run) = &outcome {
            info!("Restricted {} to {} rows", file_name, run.details["new_len"]);
        }
        outcome
    }
}
