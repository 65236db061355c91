//! Per-file, per-module run log.
//!
//! The log is the single source of truth for what is durable: an artifact
//! counts as written only when its record says so.

use crate::error::{PipelineError, Result};
use crate::registry::ModuleCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub module_name: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ModuleCategory>,
    pub completed: bool,
    pub written: bool,
    pub error: bool,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub was_modified: bool,
}

impl LogRecord {
    fn fresh(module_name: &str, file_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            file_name: file_name.to_string(),
            ..Self::default()
        }
    }

    /// Completed without error and durably written
    pub fn is_usable(&self) -> bool {
        self.written && !self.error
    }
}

/// A run that has started but not yet been recorded
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub module_name: String,
    pub file_name: String,
    pub category: ModuleCategory,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogTracker {
    files: BTreeMap<String, BTreeMap<String, LogRecord>>,
}

impl LogTracker {
    /// Start a run. Nothing is recorded until [`LogTracker::end`].
    pub fn begin(module_name: &str, category: ModuleCategory, file_name: &str) -> ActiveRun {
        ActiveRun {
            module_name: module_name.to_string(),
            file_name: file_name.to_string(),
            category,
            started_at: Utc::now(),
        }
    }

    /// Close a run and store its record, replacing any previous one
    pub fn end(&mut self, run: ActiveRun, error: bool) -> LogRecord {
        let record = LogRecord {
            module_name: run.module_name.clone(),
            file_name: run.file_name.clone(),
            category: Some(run.category),
            completed: true,
            written: false,
            error,
            start_timestamp: Some(run.started_at),
            end_timestamp: Some(Utc::now()),
            was_modified: false,
        };
        self.files
            .entry(run.file_name)
            .or_default()
            .insert(run.module_name, record.clone());
        record
    }

    /// Flag a completed, error-free run as durably written. Idempotent.
    pub fn mark_written(&mut self, file_name: &str, module_name: &str) -> Result<()> {
        let violation = |reason: &str| PipelineError::PrecedenceViolation {
            module_name: module_name.to_string(),
            file_name: file_name.to_string(),
            reason: reason.to_string(),
        };
        let record = self
            .files
            .get_mut(file_name)
            .and_then(|modules| modules.get_mut(module_name))
            .ok_or_else(|| violation("module has not run"))?;
        if !record.completed {
            return Err(violation("module has not completed"));
        }
        if record.error {
            return Err(violation("module ended with an error"));
        }
        record.written = true;
        Ok(())
    }

    /// Latest written module for `file_name` in log order, optionally only
    /// among modules strictly before `before`
    pub fn last_written(&self, file_name: &str, log_order: &[String], before: Option<&str>) -> Result<String> {
        let end = match before {
            Some(module) => log_order.iter().position(|m| m == module).ok_or_else(|| {
                PipelineError::InvalidArgument(format!("'{}' is not in the log order", module))
            })?,
            None => log_order.len(),
        };
        let records = self.files.get(file_name);
        log_order[..end]
            .iter()
            .rev()
            .find(|module| {
                records
                    .and_then(|r| r.get(module.as_str()))
                    .map(LogRecord::is_usable)
                    .unwrap_or(false)
            })
            .cloned()
            .ok_or_else(|| PipelineError::NoWrittenArtifact {
                file_name: file_name.to_string(),
            })
    }

    /// Give a file default records for the whole log order, keeping existing ones
    pub fn init_file(&mut self, file_name: &str, log_order: &[String]) {
        let records = self.files.entry(file_name.to_string()).or_default();
        for module in log_order {
            records
                .entry(module.clone())
                .or_insert_with(|| LogRecord::fresh(module, file_name));
        }
    }

    pub fn reset(&mut self, file_name: &str, module_name: &str) {
        self.files
            .entry(file_name.to_string())
            .or_default()
            .insert(module_name.to_string(), LogRecord::fresh(module_name, file_name));
    }

    pub fn reset_file(&mut self, file_name: &str, log_order: &[String]) {
        self.files.remove(file_name);
        self.init_file(file_name, log_order);
    }

    /// Record a synthetic checkpoint (e.g. a column selection) as completed
    pub fn mark_checkpoint(&mut self, file_name: &str, name: &str) {
        let now = Utc::now();
        let record = self.record_mut(file_name, name);
        record.completed = true;
        record.error = false;
        record.start_timestamp = Some(now);
        record.end_timestamp = Some(now);
    }

    /// Record a user edit of a module's inputs (completes it)
    pub fn mark_modified(&mut self, file_name: &str, name: &str) {
        let now = Utc::now();
        let record = self.record_mut(file_name, name);
        record.completed = true;
        record.error = false;
        record.was_modified = true;
        record.start_timestamp.get_or_insert(now);
        record.end_timestamp = Some(now);
    }

    pub fn record(&self, file_name: &str, module_name: &str) -> Option<&LogRecord> {
        self.files.get(file_name).and_then(|m| m.get(module_name))
    }

    pub fn is_written(&self, file_name: &str, module_name: &str) -> bool {
        self.record(file_name, module_name)
            .map(LogRecord::is_usable)
            .unwrap_or(false)
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn file_log(&self, file_name: &str) -> Option<&BTreeMap<String, LogRecord>> {
        self.files.get(file_name)
    }

    fn record_mut(&mut self, file_name: &str, module_name: &str) -> &mut LogRecord {
        self.files
            .entry(file_name.to_string())
            .or_default()
            .entry(module_name.to_string())
            .or_insert_with(|| LogRecord::fresh(module_name, file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Vec<String> {
        ["INIT", "add_selected_columns", "replace_mvs", "normalizeValues", "concat_with_init"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn run_and_write(log: &mut LogTracker, module: &str) {
        let run = LogTracker::begin(module, ModuleCategory::Transform, "f.csv");
        log.end(run, false);
        log.mark_written("f.csv", module).unwrap();
    }

    #[test]
    fn test_end_does_not_mark_written() {
        let mut log = LogTracker::default();
        let run = LogTracker::begin("replace_mvs", ModuleCategory::Transform, "f.csv");
        let record = log.end(run, false);
        assert!(record.completed);
        assert!(!record.written);
        assert!(record.start_timestamp <= record.end_timestamp);
    }

    #[test]
    fn test_mark_written_requires_clean_completion() {
        let mut log = LogTracker::default();
        log.init_file("f.csv", &order());
        assert!(matches!(
            log.mark_written("f.csv", "INIT"),
            Err(PipelineError::PrecedenceViolation { .. })
        ));

        let run = LogTracker::begin("INIT", ModuleCategory::Transform, "f.csv");
        log.end(run, true);
        assert!(log.mark_written("f.csv", "INIT").is_err());

        run_and_write(&mut log, "INIT");
        let before = log.clone();
        log.mark_written("f.csv", "INIT").unwrap();
        assert_eq!(log, before);
    }

    #[test]
    fn test_rerun_clears_written() {
        let mut log = LogTracker::default();
        run_and_write(&mut log, "replace_mvs");
        let run = LogTracker::begin("replace_mvs", ModuleCategory::Transform, "f.csv");
        log.end(run, false);
        assert!(!log.is_written("f.csv", "replace_mvs"));
    }

    #[test]
    fn test_last_written_follows_log_order() {
        let mut log = LogTracker::default();
        log.init_file("f.csv", &order());
        assert!(matches!(
            log.last_written("f.csv", &order(), None),
            Err(PipelineError::NoWrittenArtifact { .. })
        ));

        // normalizeValues written before INIT in wall-clock time
        run_and_write(&mut log, "normalizeValues");
        run_and_write(&mut log, "INIT");
        assert_eq!(log.last_written("f.csv", &order(), None).unwrap(), "normalizeValues");
        assert_eq!(
            log.last_written("f.csv", &order(), Some("normalizeValues")).unwrap(),
            "INIT"
        );
        assert!(log.last_written("f.csv", &order(), Some("INIT")).is_err());
        assert!(log.last_written("f.csv", &order(), Some("unknown")).is_err());
    }

    #[test]
    fn test_checkpoint_and_reset() {
        let mut log = LogTracker::default();
        log.init_file("f.csv", &order());
        log.mark_checkpoint("f.csv", "add_selected_columns");
        assert!(log.record("f.csv", "add_selected_columns").unwrap().completed);

        log.mark_modified("f.csv", "add_selected_columns");
        assert!(log.record("f.csv", "add_selected_columns").unwrap().was_modified);

        run_and_write(&mut log, "INIT");
        log.reset_file("f.csv", &order());
        assert_eq!(log.file_log("f.csv").unwrap().len(), 5);
        assert!(log.file_log("f.csv").unwrap().values().all(|r| !r.completed));
    }

    #[test]
    fn test_serializes_as_nested_map() {
        let mut log = LogTracker::default();
        run_and_write(&mut log, "INIT");
        let value = serde_json::to_value(&log).unwrap();
        assert_eq!(value["f.csv"]["INIT"]["written"], true);
        assert_eq!(value["f.csv"]["INIT"]["category"], "transform");
        let back: LogTracker = serde_json::from_value(value).unwrap();
        assert_eq!(back, log);
    }
}
