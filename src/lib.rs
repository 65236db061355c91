pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod invalidation;
pub mod linking;
pub mod logging;
pub mod modules;
pub mod observability;
pub mod project;
pub mod registry;
pub mod staging;
pub mod store;
pub mod table;
pub mod tracker;
pub mod upload;

pub use config::Config;
pub use engine::{CommitReport, Pipeline, RunInfo, RunOutcome};
pub use error::{PipelineError, Result};
pub use linking::{ColumnMatch, LinkRole};
pub use project::{ArtifactKey, Project};
pub use registry::{ModuleCategory, ModuleRegistry, ProjectKind};
pub use table::Table;
pub use upload::UploadReport;
