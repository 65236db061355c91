//! Compute capabilities plugged into the pipeline.
//!
//! Every capability receives a fully materialized [`Table`] and JSON
//! parameters, and reports failures as `anyhow::Error`; the engine wraps
//! them into `PipelineError::Compute` once the run has been logged.

pub mod missing_values;
pub mod results;
pub mod types;

use crate::linking::LinkInput;
use crate::table::Table;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Result of a transform or link: the new table plus module-specific details
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub table: Table,
    pub details: Value,
}

pub trait TransformModule: Send + Sync {
    fn apply(&self, table: &Table, params: &Value) -> anyhow::Result<TransformOutput>;
}

/// Produces configuration for another module. Never changes the table.
pub trait InferModule: Send + Sync {
    fn infer(&self, table: &Table, params: &Value) -> anyhow::Result<Value>;
}

/// Selects rows worth showing to a user, as indices into the table
pub trait SampleModule: Send + Sync {
    fn sample(&self, table: &Table, params: &Value) -> anyhow::Result<Vec<usize>>;
}

pub trait LinkModule: Send + Sync {
    fn link(&self, input: &LinkInput, params: &Value) -> anyhow::Result<TransformOutput>;
}

/// Deserialize module parameters, treating `null` as the type's default
pub fn parse_params<T: DeserializeOwned + Default>(params: &Value) -> anyhow::Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone()).map_err(|e| anyhow::anyhow!("Invalid module parameters: {}", e))
}
