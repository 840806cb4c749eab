//! Advisory file lock serializing snapshot writers across processes.
//!
//! Uses the OS exclusive lock on a sidecar file (`flock` on Unix,
//! `LockFileEx` on Windows). The lock belongs to the open file description,
//! so two handles opened separately exclude each other even inside one process.

use std::{
    fs::{self, File, OpenOptions, TryLockError},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use tracing::debug;
use vaultmap_core::storage::StoreError;

const LOCK_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

/// Holds the exclusive lock until dropped.
#[derive(Debug)]
pub struct FileLockGuard<'a> {
    lock: &'a FileLock,
}

impl FileLock {
    /// Opens or creates the lock file. The file is never removed afterwards.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(path.display().to_string(), e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::io(path.display().to_string(), e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held, or until `timeout` elapses.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<FileLockGuard<'_>, StoreError> {
        let Some(timeout) = timeout else {
            self.file.lock().map_err(|e| self.io_err(e))?;
            return Ok(FileLockGuard { lock: self });
        };

        let started = Instant::now();
        loop {
            match self.file.try_lock() {
                Ok(()) => return Ok(FileLockGuard { lock: self }),
                Err(TryLockError::WouldBlock) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(StoreError::Timeout {
                            location: self.path.display().to_string(),
                            waited,
                        });
                    }
                    thread::sleep(LOCK_POLL.min(timeout - waited));
                }
                Err(TryLockError::Error(e)) => return Err(self.io_err(e)),
            }
        }
    }

    fn io_err(&self, err: std::io::Error) -> StoreError {
        StoreError::io(self.path.display().to_string(), err)
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.file.unlock() {
            debug!(path = %self.lock.path.display(), %err, "unlock failed");
        }
    }
}
