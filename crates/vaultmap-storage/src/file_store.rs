use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use tempfile::Builder;
use tracing::{debug, instrument};
use vaultmap_core::storage::{SnapshotStore, StoreError};

use crate::lock::{FileLock, FileLockGuard};

/// Snapshot store backed by `<dir>/<prefix>.<ext>`.
///
/// Writes go to `<prefix>.<random>.tmp` in the same directory, are fsynced,
/// then renamed over the backing file. A sidecar `<prefix>.lock` serializes
/// writers across processes.
#[derive(Debug)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    prefix: String,
    target: PathBuf,
    lock: FileLock,
    lock_timeout: Option<Duration>,
}

impl FileSnapshotStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: &str,
        ext: &str,
        lock_timeout: Option<Duration>,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        let target = dir.join(format!("{prefix}.{ext}"));
        let lock = FileLock::open(&dir.join(format!("{prefix}.lock")))?;
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            target,
            lock,
            lock_timeout,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.target
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Copy the backing file into `dir`, holding the writer lock so the copy
    /// is a complete snapshot.
    #[instrument(skip_all, fields(target = %dir.display()))]
    pub fn backup_to(&self, dir: &Path) -> Result<PathBuf, StoreError> {
        let _guard = self.lock()?;
        let file_name = self.target.file_name().ok_or_else(|| StoreError::Storage {
            reason: "backing file has no name".to_string(),
        })?;
        let dest = dir.join(file_name);
        fs::copy(&self.target, &dest).map_err(|e| self.io_err(e))?;
        Ok(dest)
    }

    fn io_err(&self, err: std::io::Error) -> StoreError {
        StoreError::io(self.target.display().to_string(), err)
    }
}

impl SnapshotStore for FileSnapshotStore {
    type Guard<'a> = FileLockGuard<'a>;

    fn location(&self) -> String {
        self.target.display().to_string()
    }

    fn lock(&self) -> Result<Self::Guard<'_>, StoreError> {
        self.lock.acquire(self.lock_timeout)
    }

    fn read(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(&self.target) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_err(err)),
        }
    }

    fn replace(&self, bytes: &[u8]) -> Result<(), StoreError> {
        // Dropping `tmp` on any early return deletes the temp file.
        let mut tmp = Builder::new()
            .prefix(&format!("{}.", self.prefix))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| self.io_err(e))?;
        tmp.write_all(bytes).map_err(|e| self.io_err(e))?;
        tmp.flush().map_err(|e| self.io_err(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_err(e))?;
        tmp.persist(&self.target).map_err(|e| self.io_err(e.error))?;
        sync_dir(&self.dir);
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_err(err)),
        }
    }
}

/// Persist the rename itself. Best effort: not every platform can open directories.
fn sync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), %err, "directory fsync skipped");
    }
}
