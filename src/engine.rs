//! Pipeline engine: runs modules against the staging buffer and keeps the
//! run log consistent with what has been written.
//!
//! Every operation follows the same shape:
//! 1. resolve the module in the registry,
//! 2. open a run with [`LogTracker::begin`],
//! 3. compute against the materialized buffer,
//! 4. close the run (with `error=true` on failure) and save metadata.
//!
//! Nothing is written to the artifact store until [`Pipeline::commit`].

use crate::config::Config;
use crate::constants::{mini_name, run_info_name, CONCAT_WITH_INIT, INIT, INFERRED_CONFIG, NORMALIZED_SUFFIX};
use crate::error::{PipelineError, Result};
use crate::linking;
use crate::modules::InferModule;
use crate::observability;
use crate::project::{ArtifactKey, FileEntry, Project};
use crate::registry::{Compute, ModuleCategory, ModuleRegistry, ProjectKind};
use crate::staging::{BufferData, StagingBuffer};
use crate::store::lock::LockPolicy;
use crate::table::Table;
use crate::tracker::{ActiveRun, LogTracker};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Parameters a module actually ran with, persisted next to its output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub module_name: String,
    pub file_name: String,
    pub params: Value,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub module_name: String,
    pub file_name: String,
    pub row_count: usize,
    pub sha256: String,
}

/// Result of one stage of [`Pipeline::run_all`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunOutcome {
    Ran(RunInfo),
    Skipped { skipped: bool },
}

impl RunOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, RunOutcome::Skipped { .. })
    }
}

pub struct Pipeline {
    pub(crate) project: Project,
    pub(crate) registry: Arc<ModuleRegistry>,
    pub(crate) buffer: Option<StagingBuffer>,
    pub(crate) pending_runs: Vec<RunInfo>,
    pub(crate) chunk_size: usize,
    pub(crate) lock_policy: LockPolicy,
}

impl Pipeline {
    pub fn new(project: Project, registry: Arc<ModuleRegistry>) -> Self {
        Self {
            project,
            registry,
            buffer: None,
            pending_runs: Vec::new(),
            chunk_size: crate::constants::DEFAULT_CHUNK_SIZE,
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn from_config(project: Project, registry: Arc<ModuleRegistry>, config: &Config) -> Self {
        Self::new(project, registry)
            .with_chunk_size(config.chunk_size)
            .with_lock_policy(LockPolicy::from(&config.lock))
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn project_mut(&mut self) -> &mut Project {
        &mut self.project
    }

    pub fn into_project(self) -> Project {
        self.project
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn buffer(&self) -> Option<&StagingBuffer> {
        self.buffer.as_ref()
    }

    pub fn kind(&self) -> ProjectKind {
        self.project.kind()
    }

    pub(crate) fn log_order(&self) -> Vec<String> {
        self.registry.log_order(self.kind()).to_vec()
    }

    pub(crate) fn log(&mut self) -> &mut LogTracker {
        &mut self.project.metadata.log
    }

    /// Load `(module_name, file_name)` restricted to the selected columns
    pub fn load(&mut self, module_name: &str, file_name: &str) -> Result<()> {
        self.load_with(module_name, file_name, true)
    }

    /// Load an artifact lazily into the staging buffer. With `restrict`, only
    /// selected columns and the columns derived from them are kept.
    #[instrument(skip(self), fields(project = %self.project.id()))]
    pub fn load_with(&mut self, module_name: &str, file_name: &str, restrict: bool) -> Result<()> {
        let mut source = self.project.store().open_table(module_name, file_name, self.chunk_size)?;
        if restrict {
            if let Some(selected) = self.project.selected_columns() {
                let keep: Vec<String> = source
                    .columns()
                    .into_iter()
                    .filter(|c| selected.iter().any(|s| c == s || c.starts_with(&format!("{}__", s))))
                    .collect();
                source = source.restrict_to(&keep);
            }
        }
        debug!("Loaded header {:?}", source.columns());
        self.buffer = Some(StagingBuffer::lazy(module_name, file_name, source));
        self.pending_runs.clear();
        info!("Loaded ({}, {})", module_name, file_name);
        Ok(())
    }

    /// Run an infer module on the buffer and store its result as the
    /// configuration of its target module. The buffer is left untouched.
    #[instrument(skip(self, params), fields(project = %self.project.id()))]
    pub fn infer(&mut self, module_name: &str, params: &Value) -> Result<Value> {
        let (capability, write_to) = self.infer_capability(module_name)?;
        let buffer = self.buffer.as_mut().ok_or(PipelineError::BufferEmpty)?;
        let file_name = buffer.file_name().to_string();
        let table = buffer.materialize()?;

        let run = LogTracker::begin(module_name, ModuleCategory::Infer, &file_name);
        let timer = Instant::now();
        let outcome = capability.infer(table, params);
        self.finish_infer(run, &write_to, outcome, timer)
    }

    /// Run an infer module on a table other than the buffer, logged under
    /// `file_name`
    pub(crate) fn infer_on(&mut self, module_name: &str, table: &Table, file_name: &str, params: &Value) -> Result<Value> {
        let (capability, write_to) = self.infer_capability(module_name)?;
        let run = LogTracker::begin(module_name, ModuleCategory::Infer, file_name);
        let timer = Instant::now();
        let outcome = capability.infer(table, params);
        self.finish_infer(run, &write_to, outcome, timer)
    }

    fn infer_capability(&self, module_name: &str) -> Result<(Arc<dyn InferModule>, String)> {
        let descriptor = self.registry.get_as(self.kind(), module_name, ModuleCategory::Infer)?;
        let capability = match &descriptor.compute {
            Compute::Infer(capability) => capability.clone(),
            _ => return Err(not_callable(module_name)),
        };
        let write_to = descriptor
            .write_to
            .clone()
            .ok_or_else(|| PipelineError::RegistryInconsistency(format!("{} has no write_to", module_name)))?;
        Ok((capability, write_to))
    }

    fn finish_infer(
        &mut self,
        run: ActiveRun,
        write_to: &str,
        outcome: anyhow::Result<Value>,
        timer: Instant,
    ) -> Result<Value> {
        let result = match outcome {
            Ok(result) => result,
            Err(e) => return Err(self.fail_run(run, e)),
        };
        let module_name = run.module_name.clone();
        let file_name = run.file_name.clone();

        // Step 1: the config must be durable before the run is recorded as done
        if let Err(e) = self.project.store().write_json(write_to, INFERRED_CONFIG, &result) {
            self.log().end(run, true);
            self.save_after_failure();
            return Err(e);
        }
        // Step 2: close the log entry
        self.log().end(run, false);
        self.project.save()?;
        observability::stage::completed(&module_name, "infer", timer.elapsed().as_secs_f64());
        info!("Inferred {} for {} (written to {})", module_name, file_name, write_to);
        Ok(result)
    }

    /// Apply a transform module to the buffer, advancing its provenance.
    /// Nothing is persisted until [`Pipeline::commit`].
    #[instrument(skip(self, params), fields(project = %self.project.id()))]
    pub fn transform(&mut self, module_name: &str, params: &Value) -> Result<(&Table, RunInfo)> {
        if module_name == CONCAT_WITH_INIT {
            return self.concat_with_init();
        }
        let descriptor = self.registry.get_as(self.kind(), module_name, ModuleCategory::Transform)?;
        let capability = match &descriptor.compute {
            Compute::Transform(capability) => capability.clone(),
            _ => return Err(not_callable(module_name)),
        };

        let buffer = self.buffer.as_mut().ok_or(PipelineError::BufferEmpty)?;
        let file_name = buffer.file_name().to_string();
        let table = buffer.materialize()?;

        let run = LogTracker::begin(module_name, ModuleCategory::Transform, &file_name);
        let timer = Instant::now();
        let output = match capability.apply(table, params) {
            Ok(output) => output,
            Err(e) => return Err(self.fail_run(run, e)),
        };

        let run_info = self.finish_run(run, params.clone(), output.details, output.table, timer)?;
        let table = self.current_table()?;
        Ok((table, run_info))
    }

    /// Join the buffer with the uploaded table of the same file.
    ///
    /// Buffer columns without `__` are renamed `<col>__NORMALIZED`; every
    /// original column is followed by its derived columns, and derived
    /// columns matching no original column are appended.
    fn concat_with_init(&mut self) -> Result<(&Table, RunInfo)> {
        let buffer = self.buffer.as_mut().ok_or(PipelineError::BufferEmpty)?;
        let file_name = buffer.file_name().to_string();
        let transformed = buffer.materialize()?;

        let run = LogTracker::begin(CONCAT_WITH_INIT, ModuleCategory::Transform, &file_name);
        let timer = Instant::now();
        let original = self
            .project
            .store()
            .open_table(INIT, &file_name, self.chunk_size)
            .and_then(|source| source.materialize());
        let original = match original {
            Ok(original) => original,
            Err(e) => {
                self.log().end(run, true);
                self.save_after_failure();
                observability::stage::failed(CONCAT_WITH_INIT, "transform");
                return Err(e);
            }
        };

        let joined = match concat_tables(&original, transformed) {
            Ok(joined) => joined,
            Err(e) => return Err(self.fail_run(run, e)),
        };
        let details = json!({ "ncols": joined.columns.len() });
        let run_info = self.finish_run(run, json!({}), details, joined, timer)?;
        let table = self.current_table()?;
        Ok((table, run_info))
    }

    /// Run a link module (link projects only) and stage its output under
    /// `(module_name, <source file>)`
    #[instrument(skip(self, params), fields(project = %self.project.id()))]
    pub fn link(&mut self, module_name: &str, params: &Value) -> Result<(&Table, RunInfo)> {
        let descriptor = self.registry.get_as(self.kind(), module_name, ModuleCategory::Link)?;
        let capability = match &descriptor.compute {
            Compute::Link(capability) => capability.clone(),
            _ => return Err(not_callable(module_name)),
        };

        let input = linking::load_link_input(&self.project, self.chunk_size, self.lock_policy)?;
        let file_name = input.output_file_name.clone();

        let run = LogTracker::begin(module_name, ModuleCategory::Link, &file_name);
        let timer = Instant::now();
        let output = match capability.link(&input, params) {
            Ok(output) => output,
            Err(e) => return Err(self.fail_run(run, e)),
        };

        self.buffer = Some(StagingBuffer::loaded(INIT, &file_name, Table::default()));
        self.pending_runs.clear();
        let run_info = self.finish_run(run, params.clone(), output.details, output.table, timer)?;
        let table = self.current_table()?;
        Ok((table, run_info))
    }

    /// Row indices selected by a sample module. Read-only: nothing is logged.
    #[instrument(skip(self, params), fields(project = %self.project.id()))]
    pub fn sample(&mut self, module_name: &str, params: &Value) -> Result<Vec<usize>> {
        let descriptor = self.registry.get_as(self.kind(), module_name, ModuleCategory::Sample)?;
        let capability = match &descriptor.compute {
            Compute::Sample(capability) => capability.clone(),
            _ => return Err(not_callable(module_name)),
        };
        let buffer = self.buffer.as_mut().ok_or(PipelineError::BufferEmpty)?;
        let table = buffer.materialize()?;
        let rows = capability
            .sample(table, params)
            .map_err(|e| PipelineError::compute(module_name, e))?;
        debug!("{} selected {} rows", module_name, rows.len());
        Ok(rows)
    }

    /// Write the buffer at its provenance and record it as written.
    /// Committing the same buffer twice is harmless.
    #[instrument(skip(self), fields(project = %self.project.id()))]
    pub fn commit(&mut self) -> Result<CommitReport> {
        let buffer = self.buffer.as_ref().ok_or(PipelineError::BufferEmpty)?;
        let key = buffer.provenance();
        let store = self.project.store();

        let written = match (buffer.data(), buffer.is_dirty()) {
            (BufferData::Loaded(_), true) => {
                let columns = buffer.columns();
                store.write_table(&key.module_name, &key.file_name, &columns, buffer.batches(self.chunk_size)?)?
            }
            // Unchanged since load: the artifact already holds this content,
            // with every column, including those left out of the selection
            _ => {
                let artifact = store.open_table(&key.module_name, &key.file_name, self.chunk_size)?;
                crate::store::TableWrite {
                    row_count: artifact.count_rows()?,
                    sha256: crate::store::sha256_file(artifact.path())?,
                }
            }
        };
        let created: Vec<String> = buffer
            .columns()
            .into_iter()
            .filter(|c| c.contains("__"))
            .collect();

        self.log().mark_written(&key.file_name, &key.module_name)?;
        for run in &self.pending_runs {
            self.project
                .store()
                .write_json(&run.module_name, &run_info_name(&run.file_name), run)?;
        }
        self.pending_runs.clear();

        if let Some(tracker) = self.project.metadata.column_tracker.as_mut() {
            for column in created {
                if !tracker.created.contains(&column) {
                    tracker.created.push(column);
                }
            }
        }
        self.project.metadata.last_written = Some(key.clone());
        self.project.save()?;

        observability::store::committed(&key.module_name, written.row_count);
        info!(
            "Committed {} rows to ({}, {})",
            written.row_count, key.module_name, key.file_name
        );
        Ok(CommitReport {
            module_name: key.module_name,
            file_name: key.file_name,
            row_count: written.row_count,
            sha256: written.sha256,
        })
    }

    /// Replay on `file_name` every full-run module with the parameters used
    /// on its sample copy.
    ///
    /// Only projects holding a sample copy can replay; others get an empty
    /// map. Failing stages are reported as skipped and the replay goes on.
    /// The caller commits.
    #[instrument(skip(self), fields(project = %self.project.id()))]
    pub fn run_all(&mut self, file_name: &str) -> Result<BTreeMap<String, RunOutcome>> {
        let mut outcomes = BTreeMap::new();
        if !self.project.metadata.has_mini {
            warn!(
                "Project {} has no sample file; nothing to replay for {}",
                self.project.id(),
                file_name
            );
            return Ok(outcomes);
        }

        let file_name = crate::constants::full_name(file_name).to_string();
        let sample_run_info = run_info_name(&mini_name(&file_name));
        self.load(INIT, &file_name)?;

        let modules: Vec<String> = self
            .registry
            .execution_order(self.kind())
            .iter()
            .filter(|name| {
                self.registry
                    .get(self.kind(), name)
                    .map(|d| d.use_in_full_run)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        for module_name in modules {
            let params = if module_name == CONCAT_WITH_INIT {
                Ok(Value::Null)
            } else {
                match self.project.store().read_json::<RunInfo>(&module_name, &sample_run_info) {
                    Ok(Some(run)) => Ok(run.params),
                    Ok(None) => Err(format!("no run info for {}", sample_run_info)),
                    Err(e) => Err(e.to_string()),
                }
            };
            let outcome = match params {
                Ok(params) => self.transform(&module_name, &params).map(|(_, run)| run).map_err(|e| e.to_string()),
                Err(reason) => Err(reason),
            };
            match outcome {
                Ok(run) => {
                    outcomes.insert(module_name, RunOutcome::Ran(run));
                }
                Err(reason) => {
                    warn!("Module {} was not run on {}: {}", module_name, file_name, reason);
                    observability::stage::replay_skipped(&module_name);
                    outcomes.insert(module_name, RunOutcome::Skipped { skipped: true });
                }
            }
        }
        Ok(outcomes)
    }

    /// Key of the latest written artifact.
    ///
    /// With `module_name`, checks that this module was written. With
    /// `before`, only modules strictly before it in the log order count.
    /// `file_name` defaults to the file of the last commit.
    pub fn get_last_written(
        &self,
        module_name: Option<&str>,
        file_name: Option<&str>,
        before: Option<&str>,
    ) -> Result<ArtifactKey> {
        if module_name.is_some() && before.is_some() {
            return Err(PipelineError::InvalidArgument(
                "module_name and before cannot be set simultaneously".into(),
            ));
        }
        let file_name = match file_name {
            Some(file_name) => file_name.to_string(),
            None => self
                .project
                .metadata
                .last_written
                .as_ref()
                .map(|k| k.file_name.clone())
                .ok_or_else(|| PipelineError::NoWrittenArtifact {
                    file_name: String::new(),
                })?,
        };
        let log = &self.project.metadata.log;
        if let Some(module_name) = module_name {
            return if log.is_written(&file_name, module_name) {
                Ok(ArtifactKey::new(module_name, &file_name))
            } else {
                Err(PipelineError::NoWrittenArtifact { file_name })
            };
        }
        let module_name = log.last_written(&file_name, self.registry.log_order(self.kind()), before)?;
        Ok(ArtifactKey::new(&module_name, &file_name))
    }

    /// Write `INIT/MINI__<file>` holding `size` rows drawn at random (seeded),
    /// in their original order
    #[instrument(skip(self), fields(project = %self.project.id()))]
    pub fn create_sample_file(&mut self, file_name: &str, size: usize, seed: u64) -> Result<String> {
        if self.kind() != ProjectKind::Normalize {
            return Err(PipelineError::InvalidArgument("only normalize projects have sample files".into()));
        }
        let entry = self
            .project
            .metadata
            .files
            .get(file_name)
            .filter(|e| !e.is_mini)
            .cloned()
            .ok_or_else(|| PipelineError::artifact_not_found(INIT, file_name))?;
        let mini = mini_name(file_name);

        let run = LogTracker::begin(INIT, ModuleCategory::Transform, &mini);
        let table = self
            .project
            .store()
            .open_table(INIT, file_name, self.chunk_size)?
            .materialize()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut picked = if size >= table.len() {
            (0..table.len()).collect::<Vec<_>>()
        } else {
            rand::seq::index::sample(&mut rng, table.len(), size).into_vec()
        };
        picked.sort_unstable();
        let sample = Table::new(
            table.columns.clone(),
            picked.iter().map(|&i| table.rows[i].clone()).collect(),
        );
        let columns = sample.columns.clone();
        let written = self.project.store().write_table(
            INIT,
            &mini,
            &columns,
            sample.into_batches(self.chunk_size).into_iter().map(Ok),
        )?;

        let log_order = self.log_order();
        self.log().reset_file(&mini, &log_order);
        let record = self.log().end(run, false);
        self.log().mark_written(&mini, INIT)?;
        if self.project.metadata.column_tracker.as_ref().map(|t| !t.selected.is_empty()).unwrap_or(false) {
            self.log().mark_checkpoint(&mini, crate::constants::ADD_SELECTED_COLUMNS);
        }
        let run_info = RunInfo {
            module_name: INIT.to_string(),
            file_name: mini.clone(),
            params: json!({ "size": size, "seed": seed }),
            start_timestamp: record.start_timestamp.unwrap_or_else(Utc::now),
            end_timestamp: record.end_timestamp.unwrap_or_else(Utc::now),
            details: json!({ "nrows": written.row_count }),
        };
        self.project.store().write_json(INIT, &run_info_name(&mini), &run_info)?;

        self.project.metadata.files.insert(
            mini.clone(),
            FileEntry {
                og_file_name: entry.og_file_name,
                upload_time: Utc::now(),
                is_mini: true,
            },
        );
        self.project.metadata.has_mini = true;
        self.project.save()?;
        info!("Created sample {} with {} rows", mini, written.row_count);
        Ok(mini)
    }

    /// Close a failed run, persist the log and wrap the error
    pub(crate) fn fail_run(&mut self, run: ActiveRun, error: anyhow::Error) -> PipelineError {
        let module_name = run.module_name.clone();
        let category = run.category;
        self.log().end(run, true);
        self.save_after_failure();
        observability::stage::failed(&module_name, category.as_str());
        warn!("Module {} failed: {:#}", module_name, error);
        PipelineError::compute(&module_name, error)
    }

    pub(crate) fn save_after_failure(&self) {
        if let Err(e) = self.project.save() {
            warn!("Could not save metadata after a failed run: {}", e);
        }
    }

    /// Swap the output into the buffer, close the run and queue its run info
    pub(crate) fn finish_run(
        &mut self,
        run: ActiveRun,
        params: Value,
        details: Value,
        output: Table,
        timer: Instant,
    ) -> Result<RunInfo> {
        let module_name = run.module_name.clone();
        let category = run.category;
        let buffer = self.buffer.as_mut().ok_or(PipelineError::BufferEmpty)?;
        buffer.replace(&module_name, output);

        let record = self.log().end(run, false);
        let run_info = RunInfo {
            module_name: module_name.clone(),
            file_name: record.file_name.clone(),
            params,
            start_timestamp: record.start_timestamp.unwrap_or_else(Utc::now),
            end_timestamp: record.end_timestamp.unwrap_or_else(Utc::now),
            details,
        };
        self.pending_runs.retain(|r| r.module_name != module_name);
        self.pending_runs.push(run_info.clone());
        self.project.save()?;

        observability::stage::completed(&module_name, category.as_str(), timer.elapsed().as_secs_f64());
        info!("Ran {} on {}", module_name, record.file_name);
        Ok(run_info)
    }

    fn current_table(&self) -> Result<&Table> {
        self.buffer
            .as_ref()
            .and_then(|b| b.table())
            .ok_or(PipelineError::BufferEmpty)
    }
}

fn not_callable(module_name: &str) -> PipelineError {
    PipelineError::InvalidArgument(format!("module '{}' cannot be called directly", module_name))
}

fn derived_name(column: &str) -> String {
    if column.contains("__") {
        column.to_string()
    } else {
        format!("{}{}", column, NORMALIZED_SUFFIX)
    }
}

/// Horizontal join of the original table and its transformed columns
pub fn concat_tables(original: &Table, transformed: &Table) -> anyhow::Result<Table> {
    if original.len() != transformed.len() {
        anyhow::bail!(
            "row counts differ: {} original rows, {} transformed rows",
            original.len(),
            transformed.len()
        );
    }

    // Attach every derived column to the original column with the longest matching prefix
    let mut attached: Vec<Vec<usize>> = vec![Vec::new(); original.columns.len()];
    let mut leftovers = Vec::new();
    let mut names = Vec::with_capacity(transformed.columns.len());
    for (t_idx, column) in transformed.columns.iter().enumerate() {
        let name = derived_name(column);
        if original.columns.contains(&name) || names.contains(&name) {
            continue;
        }
        let owner = original
            .columns
            .iter()
            .enumerate()
            .filter(|(_, og)| name.starts_with(&format!("{}__", og)))
            .max_by_key(|(_, og)| og.len())
            .map(|(o_idx, _)| o_idx);
        match owner {
            Some(o_idx) => attached[o_idx].push(t_idx),
            None => leftovers.push(t_idx),
        }
        names.push(name);
    }

    // (source, index) for every output column
    let mut layout: Vec<(bool, usize)> = Vec::new();
    for (o_idx, derived) in attached.iter().enumerate() {
        layout.push((false, o_idx));
        layout.extend(derived.iter().map(|&t| (true, t)));
    }
    layout.extend(leftovers.iter().map(|&t| (true, t)));

    let columns = layout
        .iter()
        .map(|&(from_transformed, idx)| {
            if from_transformed {
                derived_name(&transformed.columns[idx])
            } else {
                original.columns[idx].clone()
            }
        })
        .collect();
    let rows = original
        .rows
        .iter()
        .zip(&transformed.rows)
        .map(|(og_row, t_row)| {
            layout
                .iter()
                .map(|&(from_transformed, idx)| {
                    let row = if from_transformed { t_row } else { og_row };
                    row.get(idx).cloned().unwrap_or_default()
                })
                .collect()
        })
        .collect();
    Ok(Table::new(columns, rows))
}
