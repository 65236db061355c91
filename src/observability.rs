//! Metrics for the pipeline core.
//!
//! Recording is a no-op until [`init`] installs the Prometheus recorder, so
//! library users and tests pay nothing unless they opt in.

use std::fmt;
use std::sync::OnceLock;
use tracing::info;

/// All metric names used by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    StageRuns,
    StageDuration,
    Commits,
    RowsWritten,
    Invalidations,
    LockRetries,
    LockFailures,
    ReplaySkipped,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::StageRuns => "mergeflow_stage_runs_total",
            MetricName::StageDuration => "mergeflow_stage_duration_seconds",
            MetricName::Commits => "mergeflow_commits_total",
            MetricName::RowsWritten => "mergeflow_rows_written_total",
            MetricName::Invalidations => "mergeflow_invalidated_artifacts_total",
            MetricName::LockRetries => "mergeflow_lock_retries_total",
            MetricName::LockFailures => "mergeflow_lock_failures_total",
            MetricName::ReplaySkipped => "mergeflow_replay_skipped_total",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Calling it twice is harmless.
pub fn init() -> anyhow::Result<()> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;
    METRICS_HANDLE.set(handle).ok();
    info!("Metrics system initialized");
    Ok(())
}

/// Render the current snapshot in Prometheus text format
pub fn render() -> Option<String> {
    METRICS_HANDLE.get().map(|handle| handle.render())
}

pub mod stage {
    use super::MetricName;

    pub fn completed(module_name: &str, category: &str, duration_secs: f64) {
        ::metrics::counter!(MetricName::StageRuns.as_str(),
            "module" => module_name.to_string(), "category" => category.to_string(), "outcome" => "ok")
        .increment(1);
        ::metrics::histogram!(MetricName::StageDuration.as_str(), "module" => module_name.to_string())
            .record(duration_secs);
    }

    pub fn failed(module_name: &str, category: &str) {
        ::metrics::counter!(MetricName::StageRuns.as_str(),
            "module" => module_name.to_string(), "category" => category.to_string(), "outcome" => "error")
        .increment(1);
    }

    pub fn replay_skipped(module_name: &str) {
        ::metrics::counter!(MetricName::ReplaySkipped.as_str(), "module" => module_name.to_string())
            .increment(1);
    }
}

pub mod store {
    use super::MetricName;

    pub fn committed(module_name: &str, rows: usize) {
        ::metrics::counter!(MetricName::Commits.as_str(), "module" => module_name.to_string()).increment(1);
        ::metrics::counter!(MetricName::RowsWritten.as_str()).increment(rows as u64);
    }

    pub fn invalidated(count: usize) {
        ::metrics::counter!(MetricName::Invalidations.as_str()).increment(count as u64);
    }
}

pub mod lock {
    use super::MetricName;

    pub fn retried() {
        ::metrics::counter!(MetricName::LockRetries.as_str()).increment(1);
    }

    pub fn failed() {
        ::metrics::counter!(MetricName::LockFailures.as_str()).increment(1);
    }
}
