//! Advisory locking for shared JSON artifacts.
//!
//! On Unix the lock is a `flock(2)` on the artifact's own file handle, so the
//! lock and the data share one inode and writes happen in place. Other
//! platforms fall back to an exclusive `<artifact>.lock` sidecar file.
//! Acquisition never blocks indefinitely: after the first attempt, contention
//! is retried `retries` times at a fixed interval before `ArtifactLocked`
//! surfaces.

use crate::config::LockConfig;
use crate::error::{PipelineError, Result};
use crate::observability;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Attempts after the first one
    pub retries: u32,
    pub interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockPolicy {
    fn from(config: &LockConfig) -> Self {
        Self {
            retries: config.retries,
            interval: config.retry_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct ArtifactLock {
    file: File,
    path: PathBuf,
    #[cfg(not(unix))]
    sidecar: PathBuf,
}

impl ArtifactLock {
    /// Open (creating if needed) the artifact at `path` and lock it
    pub fn acquire(path: &Path, mode: LockMode, policy: LockPolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let attempts = policy.retries + 1;
        for attempt in 1..=attempts {
            match try_lock(&file, path, mode) {
                Ok(()) => {
                    debug!("Locked {} ({:?}) after {} attempt(s)", path.display(), mode, attempt);
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                        #[cfg(not(unix))]
                        sidecar: sidecar_path(path),
                    });
                }
                Err(e) if is_contention(&e) => {
                    if attempt < attempts {
                        observability::lock::retried();
                        debug!("{} is locked, retrying in {:?}", path.display(), policy.interval);
                        thread::sleep(policy.interval);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        observability::lock::failed();
        warn!("Giving up on {} after {} attempts", path.display(), attempts);
        Err(PipelineError::ArtifactLocked {
            path: path.to_path_buf(),
            attempts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut content = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut content)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Replace the whole content of the artifact
    fn overwrite<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        unlock(self);
    }
}

/// Read-modify-write a JSON document under a single exclusive hold.
///
/// `update` receives the current content (`None` when absent or empty) and
/// returns the full new content.
pub fn update_locked<T, F>(path: &Path, policy: LockPolicy, update: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<T>) -> Result<T>,
{
    let mut lock = ArtifactLock::acquire(path, LockMode::Exclusive, policy)?;
    let current = lock.read_document()?;
    let next = update(current)?;
    lock.overwrite(&next)?;
    Ok(next)
}

/// Overwrite a JSON document under an exclusive lock
pub fn write_locked<T: Serialize + ?Sized>(path: &Path, policy: LockPolicy, value: &T) -> Result<()> {
    let mut lock = ArtifactLock::acquire(path, LockMode::Exclusive, policy)?;
    lock.overwrite(value)
}

/// Read a JSON document under a shared lock; `None` if it does not exist
pub fn read_locked<T: DeserializeOwned>(path: &Path, policy: LockPolicy) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let mut lock = ArtifactLock::acquire(path, LockMode::Shared, policy)?;
    lock.read_document()
}

fn is_contention(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::AlreadyExists)
}

#[cfg(unix)]
fn try_lock(file: &File, _path: &Path, mode: LockMode) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let operation = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    } | libc::LOCK_NB;
    let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(lock: &mut ArtifactLock) {
    use std::os::unix::io::AsRawFd;

    // Closing the descriptor releases the lock as well
    unsafe {
        libc::flock(lock.file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(not(unix))]
fn try_lock(_file: &File, path: &Path, _mode: LockMode) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(sidecar_path(path))
        .map(|_| ())
}

#[cfg(not(unix))]
fn unlock(lock: &mut ArtifactLock) {
    let _ = fs::remove_file(&lock.sidecar);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    fn fast_policy(retries: u32) -> LockPolicy {
        LockPolicy {
            retries,
            interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_update_locked_creates_and_updates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("es_linker").join("labeller.json");

        let first: Value = update_locked(&path, fast_policy(3), |current: Option<Value>| {
            assert!(current.is_none());
            Ok(json!({"count": 1}))
        })
        .unwrap();
        assert_eq!(first["count"], 1);

        update_locked(&path, fast_policy(3), |current: Option<Value>| {
            let count = current.and_then(|v| v["count"].as_i64()).unwrap_or(0);
            Ok(json!({"count": count + 1}))
        })
        .unwrap();

        let read: Value = read_locked(&path, fast_policy(3)).unwrap().unwrap();
        assert_eq!(read, json!({"count": 2}));
    }

    #[test]
    fn test_shorter_content_leaves_no_trailing_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_locked(&path, fast_policy(1), &json!({"long": "x".repeat(100)})).unwrap();
        write_locked(&path, fast_policy(1), &json!({"s": 1})).unwrap();
        let read: Value = read_locked(&path, fast_policy(1)).unwrap().unwrap();
        assert_eq!(read, json!({"s": 1}));
    }

    #[test]
    fn test_held_lock_exhausts_retries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let _held = ArtifactLock::acquire(&path, LockMode::Exclusive, fast_policy(1)).unwrap();

        let err = write_locked(&path, fast_policy(3), &json!({})).unwrap_err();
        assert!(err.is_retryable());
        match err {
            PipelineError::ArtifactLocked { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_zero_retries_tries_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_locked(&path, fast_policy(0), &json!({"free": true})).unwrap();

        let _held = ArtifactLock::acquire(&path, LockMode::Exclusive, fast_policy(0)).unwrap();
        match write_locked(&path, fast_policy(0), &json!({})) {
            Err(PipelineError::ArtifactLocked { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_read_locked_missing_file() {
        let dir = tempdir().unwrap();
        let read: Option<Value> = read_locked(&dir.path().join("missing.json"), fast_policy(1)).unwrap();
        assert!(read.is_none());
    }
}
