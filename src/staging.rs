//! The "currently loaded" table and where it came from.

use crate::error::{PipelineError, Result};
use crate::project::ArtifactKey;
use crate::table::{RowBatch, Table, TableSource};
use tracing::debug;

#[derive(Debug, Clone)]
pub enum BufferData {
    /// Not read yet; only the header is known
    Lazy(TableSource),
    Loaded(Table),
}

/// Transient, disposable holder of one table plus its provenance.
///
/// Provenance moves only through [`StagingBuffer::replace`], which the engine
/// calls after a successful transform or link. Only `replace` marks the
/// content as differing from the artifact at its provenance; reading a lazy
/// source into memory does not.
#[derive(Debug, Clone)]
pub struct StagingBuffer {
    module_name: String,
    file_name: String,
    data: BufferData,
    dirty: bool,
}

impl StagingBuffer {
    pub fn lazy(module_name: &str, file_name: &str, source: TableSource) -> Self {
        Self {
            module_name: module_name.to_string(),
            file_name: file_name.to_string(),
            data: BufferData::Lazy(source),
            dirty: false,
        }
    }

    pub fn loaded(module_name: &str, file_name: &str, table: Table) -> Self {
        Self {
            module_name: module_name.to_string(),
            file_name: file_name.to_string(),
            data: BufferData::Loaded(table),
            dirty: true,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn provenance(&self) -> ArtifactKey {
        ArtifactKey::new(&self.module_name, &self.file_name)
    }

    pub fn data(&self) -> &BufferData {
        &self.data
    }

    /// Whether the content changed since it was read from its provenance
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn columns(&self) -> Vec<String> {
        match &self.data {
            BufferData::Lazy(source) => source.columns(),
            BufferData::Loaded(table) => table.columns.clone(),
        }
    }

    /// Read the table into memory on first use
    pub fn materialize(&mut self) -> Result<&Table> {
        if let BufferData::Lazy(source) = &self.data {
            let table = source.materialize()?;
            debug!(
                "Materialized {} rows of ({}, {})",
                table.len(),
                self.module_name,
                self.file_name
            );
            self.data = BufferData::Loaded(table);
        }
        match &self.data {
            BufferData::Loaded(table) => Ok(table),
            BufferData::Lazy(_) => Err(PipelineError::BufferEmpty),
        }
    }

    pub fn table(&self) -> Option<&Table> {
        match &self.data {
            BufferData::Loaded(table) => Some(table),
            BufferData::Lazy(_) => None,
        }
    }

    /// Swap in a new table produced by `module_name`
    pub fn replace(&mut self, module_name: &str, table: Table) {
        self.module_name = module_name.to_string();
        self.data = BufferData::Loaded(table);
        self.dirty = true;
    }

    /// Row batches of the current content, re-reading lazy sources
    pub fn batches(&self, chunk_size: usize) -> Result<Box<dyn Iterator<Item = Result<RowBatch>> + '_>> {
        match &self.data {
            BufferData::Lazy(source) => Ok(Box::new(source.batches()?)),
            BufferData::Loaded(table) => {
                let columns: std::sync::Arc<[String]> = table.columns.clone().into();
                let mut chunks: Vec<Result<RowBatch>> = table
                    .rows
                    .chunks(chunk_size.max(1))
                    .map(|rows| {
                        Ok(RowBatch {
                            columns: columns.clone(),
                            rows: rows.to_vec(),
                        })
                    })
                    .collect();
                if chunks.is_empty() {
                    chunks.push(Ok(RowBatch { columns, rows: Vec::new() }));
                }
                Ok(Box::new(chunks.into_iter()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_advances_provenance_only() {
        let table = Table::new(vec!["a".into()], vec![vec!["1".into()]]);
        let mut buffer = StagingBuffer::loaded("INIT", "f.csv", table.clone());
        buffer.replace("replace_mvs", table);
        assert_eq!(buffer.provenance(), ArtifactKey::new("replace_mvs", "f.csv"));
        assert!(buffer.is_dirty());
    }

    #[test]
    fn test_materializing_keeps_buffer_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.csv");
        std::fs::write(&path, "x,y\n1,2\n").unwrap();
        let source = TableSource::open(&path, 10).unwrap().restrict_to(&["x".to_string()]);

        let mut buffer = StagingBuffer::lazy("INIT", "f.csv", source);
        assert_eq!(buffer.materialize().unwrap().columns, vec!["x".to_string()]);
        assert!(!buffer.is_dirty());

        buffer.replace("replace_mvs", Table::new(vec!["x".into()], vec![vec!["1".into()]]));
        assert!(buffer.is_dirty());
    }

    #[test]
    fn test_batches_of_loaded_table() {
        let rows = (0..5).map(|i| vec![i.to_string()]).collect();
        let buffer = StagingBuffer::loaded("INIT", "f.csv", Table::new(vec!["a".into()], rows));
        let sizes: Vec<usize> = buffer
            .batches(2)
            .unwrap()
            .map(|b| b.unwrap().rows.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let empty = StagingBuffer::loaded("INIT", "f.csv", Table::new(vec!["a".into()], vec![]));
        assert_eq!(empty.batches(2).unwrap().count(), 1);
    }
}
