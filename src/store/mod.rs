//! File-backed artifact layout.
//!
//! Artifacts are addressed by `(module_name, name)` and live at
//! `<root>/<module_name>/<name>`. The store holds no policy: it does not
//! know about logs, ordering or projects.

pub mod lock;

use crate::constants::RUN_INFO_SUFFIX;
use crate::error::{PipelineError, Result};
use crate::table::{write_csv, RowBatch, TableSource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Outcome of a table write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableWrite {
    pub row_count: usize,
    /// Hex encoded sha256 of the bytes written
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn module_dir(&self, module_name: &str) -> PathBuf {
        self.root.join(module_name)
    }

    pub fn path_to(&self, module_name: &str, name: &str) -> PathBuf {
        self.module_dir(module_name).join(name)
    }

    pub fn exists(&self, module_name: &str, name: &str) -> bool {
        self.path_to(module_name, name).is_file()
    }

    /// Open a table artifact lazily (only the header is read)
    pub fn open_table(&self, module_name: &str, file_name: &str, chunk_size: usize) -> Result<TableSource> {
        let path = self.path_to(module_name, file_name);
        if !path.is_file() {
            return Err(PipelineError::artifact_not_found(module_name, file_name));
        }
        debug!("Opening table artifact {}", path.display());
        TableSource::open(&path, chunk_size)
    }

    /// Write a table artifact all-or-nothing
    pub fn write_table<I>(&self, module_name: &str, file_name: &str, columns: &[String], batches: I) -> Result<TableWrite>
    where
        I: IntoIterator<Item = Result<RowBatch>>,
    {
        let path = self.path_to(module_name, file_name);
        let (row_count, digest) = write_atomic(&path, |file| {
            let mut hashing = HashingWriter::new(file);
            let rows = write_csv(&mut hashing, columns, batches)?;
            Ok((rows, hashing.finish()))
        })?;
        debug!("Wrote {} rows to {}", row_count, path.display());
        Ok(TableWrite {
            row_count,
            sha256: digest,
        })
    }

    /// Read a JSON document; `None` if it does not exist
    pub fn read_json<T: DeserializeOwned>(&self, module_name: &str, name: &str) -> Result<Option<T>> {
        read_json_file(&self.path_to(module_name, name))
    }

    pub fn write_json<T: Serialize + ?Sized>(&self, module_name: &str, name: &str, value: &T) -> Result<()> {
        let path = self.path_to(module_name, name);
        write_json_file(&path, value)?;
        debug!("Wrote document {}", path.display());
        Ok(())
    }

    /// Remove one artifact. Returns whether something was deleted.
    pub fn remove(&self, module_name: &str, name: &str) -> Result<bool> {
        let path = self.path_to(module_name, name);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed artifact {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a table and its run info from every module directory
    pub fn remove_everywhere(&self, file_name: &str) -> Result<Vec<String>> {
        let run_info = format!("{}{}", file_name, RUN_INFO_SUFFIX);
        let mut removed = Vec::new();
        for module_name in self.modules()? {
            let table = self.remove(&module_name, file_name)?;
            let info = self.remove(&module_name, &run_info)?;
            if table || info {
                removed.push(module_name);
            }
        }
        Ok(removed)
    }

    /// Module directories present on disk
    pub fn modules(&self) -> Result<Vec<String>> {
        let mut modules = Vec::new();
        if !self.root.is_dir() {
            return Ok(modules);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                modules.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        modules.sort();
        Ok(modules)
    }

    /// Map every table file with the given extension to the modules holding a copy
    pub fn list_files(&self, extension: &str) -> Result<BTreeMap<String, Vec<String>>> {
        let mut files: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for module_name in self.modules()? {
            for entry in fs::read_dir(self.module_dir(&module_name))? {
                let name = entry?.file_name().to_string_lossy().into_owned();
                if name.ends_with(&format!(".{}", extension)) && !is_temp_name(&name) {
                    files.entry(name).or_default().push(module_name.clone());
                }
            }
        }
        Ok(files)
    }
}

/// Write to a sibling temporary file, then rename over the target
pub fn write_atomic<R, F>(path: &Path, write: F) -> Result<R>
where
    F: FnOnce(&mut File) -> Result<R>,
{
    let parent = path
        .parent()
        .ok_or_else(|| PipelineError::InvalidArgument(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let outcome = (|| -> Result<R> {
        let mut file = File::create(&tmp_path)?;
        let value = write(&mut file)?;
        file.sync_all()?;
        Ok(value)
    })();

    match outcome {
        Ok(value) => {
            fs::rename(&tmp_path, path)?;
            Ok(value)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

/// Hex encoded sha256 of a file's content
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn write_json_file<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, |file| {
        file.write_all(&bytes)?;
        Ok(())
    })
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

/// Hashes every byte that passes through
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_table_write_is_atomic_and_hashed() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let table = Table::new(vec!["a".into()], vec![vec!["1".into()], vec!["2".into()]]);
        let columns = table.columns.clone();
        let written = store
            .write_table("INIT", "f.csv", &columns, table.into_batches(1).into_iter().map(Ok))
            .unwrap();
        assert_eq!(written.row_count, 2);

        let bytes = fs::read(store.path_to("INIT", "f.csv")).unwrap();
        assert_eq!(written.sha256, hex::encode(Sha256::digest(&bytes)));
        // no temp file left behind
        assert_eq!(fs::read_dir(store.module_dir("INIT")).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_artifacts() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(matches!(
            store.open_table("INIT", "nope.csv", 10),
            Err(PipelineError::ArtifactNotFound { .. })
        ));
        assert!(store.read_json::<serde_json::Value>("INIT", "nope.json").unwrap().is_none());
        assert!(!store.remove("INIT", "nope.csv").unwrap());
    }

    #[test]
    fn test_list_and_remove_everywhere() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let cols = vec!["a".to_string()];
        for module in ["INIT", "replace_mvs"] {
            store
                .write_table(module, "f.csv", &cols, Table::new(cols.clone(), vec![]).into_batches(1).into_iter().map(Ok))
                .unwrap();
        }
        store.write_json("replace_mvs", "f.csv__run_info.json", &json!({"params": {}})).unwrap();

        let files = store.list_files("csv").unwrap();
        assert_eq!(files["f.csv"], vec!["INIT", "replace_mvs"]);

        let removed = store.remove_everywhere("f.csv").unwrap();
        assert_eq!(removed, vec!["INIT", "replace_mvs"]);
        assert!(!store.exists("replace_mvs", "f.csv__run_info.json"));
        assert!(store.list_files("csv").unwrap().is_empty());
    }
}
