use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No artifact for module '{module_name}' and file '{file_name}'")]
    ArtifactNotFound {
        module_name: String,
        file_name: String,
    },

    #[error("No written data could be found in logs for file '{file_name}'")]
    NoWrittenArtifact { file_name: String },

    #[error("Cannot mark '{module_name}' as written for '{file_name}': {reason}")]
    PrecedenceViolation {
        module_name: String,
        file_name: String,
        reason: String,
    },

    #[error("{} is un-writable because it was locked by another process ({attempts} attempts)", path.display())]
    ArtifactLocked { path: PathBuf, attempts: u32 },

    #[error("Module registry is inconsistent: {0}")]
    RegistryInconsistency(String),

    #[error("Unsupported file type '{0}': file name should end with .csv, .xls or .xlsx")]
    UnsupportedFileType(String),

    #[error("Separator and/or encoding not detected. Try uploading a csv with ',' as separator and utf-8 encoding")]
    UndetectableFormat,

    #[error("Column names should all be different (duplicates: {0:?})")]
    DuplicateColumns(Vec<String>),

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Module '{module_name}' is not a {expected} module")]
    WrongCategory {
        module_name: String,
        expected: String,
    },

    #[error("No data loaded in the staging buffer (call load first)")]
    BufferEmpty,

    #[error("Module '{module_name}' failed: {source}")]
    Compute {
        module_name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid column selection: {0}")]
    InvalidColumnSelection(String),

    #[error("File '{0}' cannot be uploaded: project already has an uploaded file")]
    FileAlreadyUploaded(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Excel read failed: {0}")]
    Excel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    pub fn artifact_not_found(module_name: &str, file_name: &str) -> Self {
        PipelineError::ArtifactNotFound {
            module_name: module_name.to_string(),
            file_name: file_name.to_string(),
        }
    }

    pub fn compute(module_name: &str, source: anyhow::Error) -> Self {
        PipelineError::Compute {
            module_name: module_name.to_string(),
            source,
        }
    }

    /// Lock contention is the only failure callers are expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::ArtifactLocked { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
