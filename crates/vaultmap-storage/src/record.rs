//! On-disk envelope and the two-layer entry encoding.
//!
//! Layering when encryption is on: every value is sealed with the salt key,
//! the resulting `key -> sealed bytes` map is serialized, and that whole map
//! is sealed again with the pepper key.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vaultmap_core::Value;

use crate::{
    crypt::{self, CryptError},
    key_material::KeyMaterial,
};

pub const RECORD_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),
    #[error("record is encrypted but no key material is loaded")]
    MissingKeys,
    #[error(transparent)]
    Crypt(#[from] CryptError),
}

/// The unit stored in a backing file: an encryption flag plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRecord {
    pub encrypted: bool,
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u8,
    encrypted: bool,
    payload: String,
}

impl EncryptedRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        let envelope = Envelope {
            version: RECORD_VERSION,
            encrypted: self.encrypted,
            payload: URL_SAFE_NO_PAD.encode(&self.payload),
        };
        serde_json::to_vec(&envelope).map_err(|e| RecordError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| RecordError::Malformed(e.to_string()))?;
        if envelope.version != RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion(envelope.version));
        }
        let payload = URL_SAFE_NO_PAD
            .decode(envelope.payload)
            .map_err(|e| RecordError::Malformed(format!("payload: {e}")))?;
        Ok(Self {
            encrypted: envelope.encrypted,
            payload,
        })
    }

    /// Build a record from plain entries, encrypting when `keys` is given.
    pub fn encode(
        entries: &BTreeMap<String, Value>,
        keys: Option<&KeyMaterial>,
    ) -> Result<Self, RecordError> {
        let Some(keys) = keys else {
            let payload = serde_json::to_vec(entries)
                .map_err(|e| CryptError::Encoding(e.to_string()))?;
            return Ok(Self {
                encrypted: false,
                payload,
            });
        };

        let mut sealed = BTreeMap::new();
        for (name, value) in entries {
            let bytes = crypt::seal(&keys.salt, value)?;
            sealed.insert(name.as_str(), URL_SAFE_NO_PAD.encode(bytes));
        }
        Ok(Self {
            encrypted: true,
            payload: crypt::seal(&keys.pepper, &sealed)?,
        })
    }

    /// Recover plain entries. Plain records are accepted even when keys are loaded.
    pub fn decode(
        &self,
        keys: Option<&KeyMaterial>,
    ) -> Result<BTreeMap<String, Value>, RecordError> {
        if !self.encrypted {
            return serde_json::from_slice(&self.payload)
                .map_err(|e| RecordError::Malformed(e.to_string()));
        }

        let keys = keys.ok_or(RecordError::MissingKeys)?;
        let sealed: BTreeMap<String, String> = crypt::open(&keys.pepper, &self.payload)?;
        sealed
            .into_iter()
            .map(|(name, encoded)| {
                let bytes = URL_SAFE_NO_PAD
                    .decode(encoded)
                    .map_err(|e| RecordError::Malformed(format!("entry '{name}': {e}")))?;
                let value: Value = crypt::open(&keys.salt, &bytes)?;
                Ok((name, value))
            })
            .collect()
    }
}
