use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;

/// Errors produced by snapshot store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying file-system failure (permission denied, disk full, ...).
    #[error("i/o failure at {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
    /// The exclusive lock could not be acquired before the deadline.
    #[error("timed out after {waited:?} waiting for lock on {location}")]
    Timeout { location: String, waited: Duration },
    /// Any other backend failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

impl StoreError {
    pub fn io(location: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            location: location.into(),
            source,
        }
    }
}

/// Medium holding one complete, self-consistent snapshot of a mapping.
///
/// Writers follow "lock, read full state, merge, replace full state". The
/// guard returned by [`SnapshotStore::lock`] must exclude every other holder
/// of the same snapshot (other handles, other processes) until dropped.
pub trait SnapshotStore: Send + Sync {
    type Guard<'a>
    where
        Self: 'a;

    /// Human-readable location used in logs and errors.
    fn location(&self) -> String;

    /// Acquire the exclusive snapshot lock.
    fn lock(&self) -> Result<Self::Guard<'_>, StoreError>;

    /// Read the full snapshot. Absent or empty snapshots yield `None`.
    fn read(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically replace the full snapshot. Readers observe either the old
    /// or the new bytes, never a mix.
    fn replace(&self, bytes: &[u8]) -> Result<(), StoreError>;

    /// Delete the snapshot (idempotent).
    fn remove(&self) -> Result<(), StoreError>;
}

/// In-memory snapshot store for tests and ephemeral mappings.
/// Clones share the same snapshot and lock, which models several processes
/// pointed at one backing file.
#[derive(Debug, Default, Clone)]
pub struct InMemorySnapshotStore {
    lock: Arc<Mutex<()>>,
    inner: Arc<Mutex<Option<Vec<u8>>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes currently held, as a file reader would see them.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.data().clone()
    }

    fn data(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    type Guard<'a> = MutexGuard<'a, ()>;

    fn location(&self) -> String {
        "memory".to_string()
    }

    fn lock(&self) -> Result<Self::Guard<'_>, StoreError> {
        Ok(self.lock.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn read(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data().clone().filter(|bytes| !bytes.is_empty()))
    }

    fn replace(&self, bytes: &[u8]) -> Result<(), StoreError> {
        *self.data() = Some(bytes.to_vec());
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        self.data().take();
        Ok(())
    }
}
