//! Single-value authenticated encryption.
//!
//! A [`CryptHandle`] holds at most one sealed payload. Sealing serializes the
//! value to JSON and encrypts it with AES-256-GCM under a fresh random nonce;
//! the sealed layout is `nonce (12 bytes) || ciphertext || tag`.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::key_material::KeyHandle;

pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptError {
    #[error("nothing to decrypt: handle holds no ciphertext")]
    Empty,
    #[error("encrypt failed: {0}")]
    Encrypt(String),
    #[error("decrypt failed with key '{alias}'")]
    Decrypt { alias: String },
    #[error("value encoding failed: {0}")]
    Encoding(String),
    #[error("decrypted payload is malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CryptHandle {
    sealed: Option<Vec<u8>>,
}

impl CryptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sealed(bytes: Vec<u8>) -> Self {
        Self {
            sealed: Some(bytes),
        }
    }

    /// Serialize and encrypt `value`, replacing any payload already held.
    pub fn encrypt<T: Serialize + ?Sized>(
        &mut self,
        key: &KeyHandle,
        value: &T,
    ) -> Result<(), CryptError> {
        let plain = Zeroizing::new(
            serde_json::to_vec(value).map_err(|e| CryptError::Encoding(e.to_string()))?,
        );
        self.encrypt_bytes(key, &plain)
    }

    pub fn encrypt_bytes(&mut self, key: &KeyHandle, plain: &[u8]) -> Result<(), CryptError> {
        let cipher = build_cipher(key)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plain)
            .map_err(|e| CryptError::Encrypt(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        self.sealed = Some(sealed);
        Ok(())
    }

    pub fn decrypt<T: DeserializeOwned>(&self, key: &KeyHandle) -> Result<T, CryptError> {
        let plain = self.decrypt_bytes(key)?;
        serde_json::from_slice(&plain).map_err(|e| CryptError::Malformed(e.to_string()))
    }

    pub fn decrypt_bytes(&self, key: &KeyHandle) -> Result<Zeroizing<Vec<u8>>, CryptError> {
        let sealed = self.sealed.as_deref().ok_or(CryptError::Empty)?;
        if sealed.len() < NONCE_LEN {
            return Err(CryptError::Decrypt {
                alias: key.alias().to_string(),
            });
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = build_cipher(key)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CryptError::Decrypt {
                alias: key.alias().to_string(),
            })
    }

    pub fn sealed(&self) -> Option<&[u8]> {
        self.sealed.as_deref()
    }

    pub fn into_sealed(self) -> Option<Vec<u8>> {
        self.sealed
    }

    pub fn is_empty(&self) -> bool {
        self.sealed.is_none()
    }
}

/// Seal `value` in one call.
pub fn seal<T: Serialize + ?Sized>(key: &KeyHandle, value: &T) -> Result<Vec<u8>, CryptError> {
    let mut handle = CryptHandle::new();
    handle.encrypt(key, value)?;
    handle.into_sealed().ok_or(CryptError::Empty)
}

/// Open bytes produced by [`seal`].
pub fn open<T: DeserializeOwned>(key: &KeyHandle, sealed: &[u8]) -> Result<T, CryptError> {
    CryptHandle::from_sealed(sealed.to_vec()).decrypt(key)
}

fn build_cipher(key: &KeyHandle) -> Result<Aes256Gcm, CryptError> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| CryptError::Encrypt(e.to_string()))
}
