//! In-memory tables and restartable row-batch producers.
//!
//! A [`TableSource`] never holds data itself: every call to
//! [`TableSource::batches`] re-opens the underlying artifact and yields finite
//! [`RowBatch`]es, so the same source can be consumed several times.
//! Compute modules always receive a materialized [`Table`].

use crate::error::{PipelineError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A fully materialized table of string cells
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Iterate over the values of one column
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .map(move |row| row.get(idx).map(String::as_str).unwrap_or(""))
    }

    /// Append another table's rows; both must share the same header
    pub fn extend(&mut self, batch: RowBatch) -> Result<()> {
        if self.columns.is_empty() && self.rows.is_empty() {
            self.columns = batch.columns.to_vec();
        } else if self.columns[..] != batch.columns[..] {
            return Err(PipelineError::InvalidArgument(
                "cannot append a batch with a different header".into(),
            ));
        }
        self.rows.extend(batch.rows);
        Ok(())
    }

    /// Split into batches of at most `chunk_size` rows (at least one batch,
    /// even for an empty table, so the header is always carried)
    pub fn into_batches(self, chunk_size: usize) -> Vec<RowBatch> {
        let columns: Arc<[String]> = self.columns.into();
        if self.rows.is_empty() {
            return vec![RowBatch { columns, rows: Vec::new() }];
        }
        let mut batches = Vec::new();
        let mut rows = self.rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<Vec<String>> = rows.by_ref().take(chunk_size.max(1)).collect();
            batches.push(RowBatch {
                columns: columns.clone(),
                rows: chunk,
            });
        }
        batches
    }
}

/// A chunk of rows sharing a header
#[derive(Debug, Clone)]
pub struct RowBatch {
    pub columns: Arc<[String]>,
    pub rows: Vec<Vec<String>>,
}

/// Restartable, finite producer of row batches backed by a CSV artifact
#[derive(Debug, Clone)]
pub struct TableSource {
    path: PathBuf,
    chunk_size: usize,
    /// Columns of the file, in file order
    header: Vec<String>,
    /// Indices of the columns to keep, `None` for all
    projection: Option<Vec<usize>>,
}

impl TableSource {
    /// Open a CSV artifact (UTF-8, comma separated) and read its header
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let header = reader.headers()?.iter().map(|h| h.to_string()).collect();
        Ok(Self {
            path: path.to_path_buf(),
            chunk_size: chunk_size.max(1),
            header,
            projection: None,
        })
    }

    /// Restrict the source to the given columns. Unknown names are ignored;
    /// file order is kept.
    pub fn restrict_to(mut self, columns: &[String]) -> Self {
        let keep: Vec<usize> = self
            .header
            .iter()
            .enumerate()
            .filter(|(_, c)| columns.contains(c))
            .map(|(i, _)| i)
            .collect();
        self.projection = Some(keep);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header after projection
    pub fn columns(&self) -> Vec<String> {
        match &self.projection {
            Some(keep) => keep.iter().map(|&i| self.header[i].clone()).collect(),
            None => self.header.clone(),
        }
    }

    /// Start a new pass over the artifact
    pub fn batches(&self) -> Result<BatchIter> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)?;
        Ok(BatchIter {
            records: reader.into_records(),
            columns: self.columns().into(),
            projection: self.projection.clone(),
            chunk_size: self.chunk_size,
            emitted: false,
            done: false,
        })
    }

    /// Read every batch into memory
    pub fn materialize(&self) -> Result<Table> {
        let mut table = Table::new(self.columns(), Vec::new());
        for batch in self.batches()? {
            table.rows.extend(batch?.rows);
        }
        Ok(table)
    }

    pub fn count_rows(&self) -> Result<usize> {
        let mut count = 0;
        for batch in self.batches()? {
            count += batch?.rows.len();
        }
        Ok(count)
    }
}

/// One pass over a [`TableSource`]
pub struct BatchIter {
    records: csv::StringRecordsIntoIter<File>,
    columns: Arc<[String]>,
    projection: Option<Vec<usize>>,
    chunk_size: usize,
    emitted: bool,
    done: bool,
}

impl Iterator for BatchIter {
    type Item = Result<RowBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut rows = Vec::with_capacity(self.chunk_size);
        while rows.len() < self.chunk_size {
            match self.records.next() {
                Some(Ok(record)) => rows.push(project(&record, self.projection.as_deref())),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        // An empty artifact still yields one (empty) batch carrying the header
        if rows.is_empty() && self.emitted {
            return None;
        }
        self.emitted = true;
        Some(Ok(RowBatch {
            columns: self.columns.clone(),
            rows,
        }))
    }
}

fn project(record: &csv::StringRecord, projection: Option<&[usize]>) -> Vec<String> {
    match projection {
        Some(keep) => keep
            .iter()
            .map(|&i| record.get(i).unwrap_or("").to_string())
            .collect(),
        None => record.iter().map(|v| v.to_string()).collect(),
    }
}

/// Write batches as a UTF-8, comma separated CSV. Returns the number of data rows.
pub fn write_csv<W, I>(writer: W, columns: &[String], batches: I) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = Result<RowBatch>>,
{
    let mut csv_writer = csv::WriterBuilder::new().from_writer(BufWriter::new(writer));
    csv_writer.write_record(columns)?;
    let mut count = 0;
    for batch in batches {
        let batch = batch?;
        if batch.columns[..] != columns[..] {
            return Err(PipelineError::InvalidArgument(
                "batch header does not match table header".into(),
            ));
        }
        for row in &batch.rows {
            csv_writer.write_record(row)?;
        }
        count += batch.rows.len();
    }
    csv_writer.flush()?;
    Ok(count)
}

/// Return the duplicated names of a header, in first-seen order
pub fn duplicate_columns(columns: &[String]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for c in columns {
        *seen.entry(c.as_str()).or_default() += 1;
    }
    let mut dups: Vec<String> = Vec::new();
    for c in columns {
        if seen[c.as_str()] > 1 && !dups.contains(c) {
            dups.push(c.clone());
        }
    }
    dups
}
