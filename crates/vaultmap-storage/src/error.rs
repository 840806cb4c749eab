use std::time::Duration;

use thiserror::Error;
use vaultmap_core::storage::StoreError;

use crate::key_material::KeyError;

/// Errors surfaced by [`crate::mapping::EncryptedMapping`].
#[derive(Debug, Error)]
pub enum MappingError {
    /// Invalid construction arguments or missing key material. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("key not found: {key}")]
    KeyNotFound { key: String },
    #[error("mapping is empty")]
    Empty,
    /// The backing snapshot is corrupt or was written with other keys.
    #[error("cannot decrypt {location}: {reason}")]
    Decryption { location: String, reason: String },
    #[error("encoding failed: {0}")]
    Encoding(String),
    /// The read-merge-write cycle failed on every attempt; `source` is the last failure.
    #[error("sync failed after {attempts} attempts: {source}")]
    Sync {
        attempts: u32,
        #[source]
        source: Box<MappingError>,
    },
    #[error("i/o failure at {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {waited:?} waiting for lock on {location}")]
    Timeout { location: String, waited: Duration },
}

impl MappingError {
    /// The innermost failure, looking through `Sync`.
    pub fn root_cause(&self) -> &MappingError {
        match self {
            MappingError::Sync { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_io(&self) -> bool {
        matches!(self.root_cause(), MappingError::Io { .. })
    }
}

impl From<StoreError> for MappingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io { location, source } => MappingError::Io { location, source },
            StoreError::Timeout { location, waited } => MappingError::Timeout { location, waited },
            StoreError::Storage { reason } => MappingError::Io {
                location: "store".to_string(),
                source: std::io::Error::other(reason),
            },
        }
    }
}

impl From<KeyError> for MappingError {
    fn from(err: KeyError) -> Self {
        MappingError::Configuration(err.to_string())
    }
}
