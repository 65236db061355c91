//! Project handle and its metadata document.

use crate::constants::METADATA_FILE;
use crate::error::{PipelineError, Result};
use crate::registry::ProjectKind;
use crate::store::{read_json_file, write_json_file, ArtifactStore};
use crate::tracker::LogTracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Address of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub module_name: String,
    pub file_name: String,
}

impl ArtifactKey {
    pub fn new(module_name: &str, file_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            file_name: file_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Name as given by the user, before sanitization
    pub og_file_name: String,
    pub upload_time: DateTime<Utc>,
    #[serde(default)]
    pub is_mini: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnTracker {
    pub original: Vec<String>,
    pub selected: Vec<String>,
    #[serde(default)]
    pub created: Vec<String>,
}

/// A table of a normalize project used by a link project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedFile {
    pub project_id: String,
    pub module_name: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkFiles {
    pub source: Option<LinkedFile>,
    #[serde(rename = "ref")]
    pub reference: Option<LinkedFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub project_id: String,
    pub kind: ProjectKind,
    pub display_name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
    #[serde(default)]
    pub column_tracker: Option<ColumnTracker>,
    #[serde(default)]
    pub log: LogTracker,
    #[serde(default)]
    pub has_mini: bool,
    #[serde(default)]
    pub last_written: Option<ArtifactKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkFiles>,
}

/// An opened project: its directory, artifact store and in-memory metadata.
///
/// The metadata is only persisted by [`Project::save`]; [`Project::reload`]
/// discards local changes in favor of the document on disk.
#[derive(Debug, Clone)]
pub struct Project {
    projects_root: PathBuf,
    dir: PathBuf,
    store: ArtifactStore,
    pub metadata: ProjectMetadata,
}

impl Project {
    pub fn create(projects_root: &Path, kind: ProjectKind, display_name: &str, description: &str) -> Result<Self> {
        let project_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = project_dir(projects_root, kind, &project_id);
        fs::create_dir_all(&dir)?;

        let metadata = ProjectMetadata {
            project_id: project_id.clone(),
            kind,
            display_name: display_name.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            files: BTreeMap::new(),
            column_tracker: None,
            log: LogTracker::default(),
            has_mini: false,
            last_written: None,
            link: match kind {
                ProjectKind::Link => Some(LinkFiles::default()),
                ProjectKind::Normalize => None,
            },
        };
        let project = Self {
            projects_root: projects_root.to_path_buf(),
            store: ArtifactStore::new(&dir),
            dir,
            metadata,
        };
        project.save()?;
        info!("Created {} project {}", kind, project_id);
        Ok(project)
    }

    pub fn open(projects_root: &Path, kind: ProjectKind, project_id: &str) -> Result<Self> {
        let dir = project_dir(projects_root, kind, project_id);
        let metadata: ProjectMetadata = read_json_file(&dir.join(METADATA_FILE))?
            .ok_or_else(|| PipelineError::ProjectNotFound(format!("{}/{}", kind, project_id)))?;
        debug!("Opened {} project {}", kind, project_id);
        Ok(Self {
            projects_root: projects_root.to_path_buf(),
            store: ArtifactStore::new(&dir),
            dir,
            metadata,
        })
    }

    /// Re-read the metadata document from disk
    pub fn reload(&mut self) -> Result<()> {
        self.metadata = read_json_file(&self.metadata_path())?
            .ok_or_else(|| PipelineError::ProjectNotFound(self.metadata.project_id.clone()))?;
        Ok(())
    }

    /// Persist the whole metadata document (last write wins)
    pub fn save(&self) -> Result<()> {
        write_json_file(&self.metadata_path(), &self.metadata)?;
        debug!("Saved metadata of project {}", self.metadata.project_id);
        Ok(())
    }

    /// Metadata of every project of a kind, oldest first
    pub fn list(projects_root: &Path, kind: ProjectKind) -> Result<Vec<ProjectMetadata>> {
        let kind_dir = projects_root.join(kind.as_str());
        let mut projects = Vec::new();
        if !kind_dir.is_dir() {
            return Ok(projects);
        }
        for entry in fs::read_dir(&kind_dir)? {
            let path = entry?.path().join(METADATA_FILE);
            if let Some(metadata) = read_json_file::<ProjectMetadata>(&path)? {
                projects.push(metadata);
            }
        }
        projects.sort_by_key(|m| m.created_at);
        Ok(projects)
    }

    pub fn id(&self) -> &str {
        &self.metadata.project_id
    }

    pub fn kind(&self) -> ProjectKind {
        self.metadata.kind
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Uploaded files, sample copies excluded
    pub fn uploaded_files(&self) -> Vec<&str> {
        self.metadata
            .files
            .iter()
            .filter(|(_, entry)| !entry.is_mini)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn selected_columns(&self) -> Option<&[String]> {
        self.metadata
            .column_tracker
            .as_ref()
            .map(|t| t.selected.as_slice())
            .filter(|s| !s.is_empty())
    }
}

fn project_dir(projects_root: &Path, kind: ProjectKind, project_id: &str) -> PathBuf {
    projects_root.join(kind.as_str()).join(project_id)
}
