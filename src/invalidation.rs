//! Cascading invalidation of downstream artifacts.

use crate::constants::{ADD_SELECTED_COLUMNS, INIT};
use crate::engine::Pipeline;
use crate::error::{PipelineError, Result};
use crate::observability;
use crate::project::{ArtifactKey, ColumnTracker};
use tracing::{info, instrument};

impl Pipeline {
    /// Delete `(m, file_name)` for every `m` from `module_name` onwards in the
    /// log order (excluding `module_name` unless `inclusive`) and reset their
    /// log records. Missing artifacts are not an error.
    #[instrument(skip(self), fields(project = %self.project.id()))]
    pub fn invalidate_from(&mut self, file_name: &str, module_name: &str, inclusive: bool) -> Result<Vec<String>> {
        let log_order = self.log_order();
        let start = log_order
            .iter()
            .position(|m| m == module_name)
            .ok_or_else(|| PipelineError::UnknownModule(module_name.to_string()))?;
        let start = if inclusive { start } else { start + 1 };

        let mut removed = Vec::new();
        for module in &log_order[start..] {
            let table = self.project.store().remove(module, file_name)?;
            let run_info = self
                .project
                .store()
                .remove(module, &crate::constants::run_info_name(file_name))?;
            if table || run_info {
                removed.push(module.clone());
            }
            self.log().reset(file_name, module);
        }

        if let Some(buffer) = &self.buffer {
            if buffer.file_name() == file_name && log_order[start..].iter().any(|m| m == buffer.module_name()) {
                info!("Dropping staged ({}, {})", buffer.module_name(), file_name);
                self.buffer = None;
                self.pending_runs.clear();
            }
        }

        // Fall back to what is still written for this file
        let stale = self
            .project
            .metadata
            .last_written
            .as_ref()
            .map(|last| last.file_name == file_name && log_order[start..].contains(&last.module_name))
            .unwrap_or(false);
        if stale {
            self.project.metadata.last_written = self
                .project
                .metadata
                .log
                .last_written(file_name, &log_order, None)
                .ok()
                .map(|module| ArtifactKey::new(&module, file_name));
        }

        self.project.save()?;
        observability::store::invalidated(removed.len());
        info!(
            "Invalidated {} from {} (inclusive: {}): removed {:?}",
            file_name, module_name, inclusive, removed
        );
        Ok(removed)
    }

    /// Choose the columns to process. Selecting a column that was not
    /// selected before invalidates everything after `INIT` for every file.
    #[instrument(skip(self), fields(project = %self.project.id()))]
    pub fn select_columns(&mut self, columns: &[String]) -> Result<()> {
        if columns.is_empty() {
            return Err(PipelineError::InvalidColumnSelection("select at least one column".into()));
        }
        let tracker: ColumnTracker = self
            .project
            .metadata
            .column_tracker
            .clone()
            .ok_or_else(|| PipelineError::InvalidColumnSelection("no file was uploaded".into()))?;
        if let Some(unknown) = columns.iter().find(|c| !tracker.original.contains(*c)) {
            return Err(PipelineError::InvalidColumnSelection(format!(
                "'{}' is not in the uploaded header {:?}",
                unknown, tracker.original
            )));
        }

        let widened = columns.iter().any(|c| !tracker.selected.contains(c));
        let files: Vec<String> = self.project.metadata.files.keys().cloned().collect();
        if widened {
            for file_name in &files {
                self.invalidate_from(file_name, INIT, false)?;
            }
        }

        let logged: Vec<String> = self.project.metadata.log.files().map(str::to_string).collect();
        for file_name in &logged {
            self.log().mark_checkpoint(file_name, ADD_SELECTED_COLUMNS);
        }
        if let Some(tracker) = self.project.metadata.column_tracker.as_mut() {
            tracker.selected = columns.to_vec();
        }
        self.project.save()?;
        info!("Selected columns {:?} (widened: {})", columns, widened);
        Ok(())
    }

    /// Remove every artifact of `file_name` and reset its log
    #[instrument(skip(self), fields(project = %self.project.id()))]
    pub fn remove_all(&mut self, file_name: &str) -> Result<Vec<String>> {
        let removed = self.project.store().remove_everywhere(file_name)?;
        let log_order = self.log_order();
        self.log().reset_file(file_name, &log_order);
        if self.buffer.as_ref().map(|b| b.file_name() == file_name).unwrap_or(false) {
            self.buffer = None;
            self.pending_runs.clear();
        }
        if self
            .project
            .metadata
            .last_written
            .as_ref()
            .map(|k| k.file_name == file_name)
            .unwrap_or(false)
        {
            self.project.metadata.last_written = None;
        }
        self.project.save()?;
        observability::store::invalidated(removed.len());
        info!("Removed {} from {:?}", file_name, removed);
        Ok(removed)
    }
}
