//! Labelling session shared by concurrent labellers.
//!
//! The session document is only ever updated under an exclusive lock, so two
//! processes labelling the same project never lose each other's labels.

use crate::error::Result;
use crate::store::lock::{update_locked, LockPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub source_row: usize,
    pub ref_row: usize,
    pub is_match: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabellingSession {
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LabellingSession {
    /// Add a label; a later answer for the same pair replaces the earlier one
    pub fn add(&mut self, label: Label) {
        self.labels
            .retain(|l| !(l.source_row == label.source_row && l.ref_row == label.ref_row));
        self.labels.push(label);
        self.updated_at = Some(Utc::now());
    }

    pub fn num_matches(&self) -> usize {
        self.labels.iter().filter(|l| l.is_match).count()
    }
}

/// Append a label to the session stored at `path`
pub fn record_label(path: &Path, policy: LockPolicy, label: Label) -> Result<LabellingSession> {
    let session = update_locked(path, policy, |current: Option<LabellingSession>| {
        let mut session = current.unwrap_or_default();
        session.add(label);
        Ok(session)
    })?;
    debug!("Labelling session at {} has {} labels", path.display(), session.labels.len());
    Ok(session)
}
