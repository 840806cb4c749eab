use std::{
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of every symmetric key handled here (AES-256).
pub const KEY_LEN: usize = 32;
pub const SALT_FILE: &str = "Salt.key";
pub const PEPPER_FILE: &str = "Pepper.key";
pub const POINTER_FILE: &str = "Key.dir";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no key material found in {location}")]
    Missing { location: String },
    #[error("invalid key file {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("key file i/o at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing to overwrite existing key file {path}")]
    AlreadyExists { path: PathBuf },
    #[error("keyring error: {0}")]
    Keyring(String),
}

/// One symmetric key plus the alias it is known by. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyHandle {
    #[zeroize(skip)]
    alias: String,
    bytes: [u8; KEY_LEN],
}

impl KeyHandle {
    pub fn new(alias: impl Into<String>, bytes: [u8; KEY_LEN]) -> Self {
        Self {
            alias: alias.into(),
            bytes,
        }
    }

    pub fn generate(alias: impl Into<String>) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self::new(alias, bytes)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Load a handle from a key file written by [`KeyHandle::write_file`].
    pub fn read_file(path: &Path) -> Result<Self, KeyError> {
        let raw = fs::read(path).map_err(|source| KeyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: KeyFile = serde_json::from_slice(&raw).map_err(|e| KeyError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let bytes = decode_key(&file.key).map_err(|reason| KeyError::Decode {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(Self::new(file.alias, bytes))
    }

    /// Write the handle to a new file. Existing files are never overwritten.
    pub fn write_file(&self, path: &Path) -> Result<(), KeyError> {
        let file = KeyFile {
            alias: self.alias.clone(),
            key: encode_key(&self.bytes),
        };
        let body = serde_json::to_vec_pretty(&file).map_err(|e| KeyError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        write_new_private(path, &body)
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("alias", &self.alias)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    alias: String,
    key: String,
}

/// Indirection record naming the salt and pepper key files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPointer {
    pub salt: PathBuf,
    pub pepper: PathBuf,
}

impl KeyPointer {
    pub fn new(salt: impl Into<PathBuf>, pepper: impl Into<PathBuf>) -> Self {
        Self {
            salt: salt.into(),
            pepper: pepper.into(),
        }
    }

    pub fn read_file(path: &Path) -> Result<Self, KeyError> {
        let raw = fs::read(path).map_err(|source| KeyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|e| KeyError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Write this pointer as `Key.dir` inside `dir`, replacing any previous pointer.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf, KeyError> {
        let path = dir.join(POINTER_FILE);
        let body = serde_json::to_vec_pretty(self).map_err(|e| KeyError::Decode {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, body).map_err(|source| KeyError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Load the referenced key files. Both paths must exist.
    pub fn resolve(&self) -> Result<KeyMaterial, KeyError> {
        for path in [&self.salt, &self.pepper] {
            if !path.is_file() {
                return Err(KeyError::Missing {
                    location: path.display().to_string(),
                });
            }
        }
        KeyMaterial::load_pair(&self.salt, &self.pepper)
    }
}

/// Where a [`KeyMaterial`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOrigin {
    Files { salt: PathBuf, pepper: PathBuf },
    Keyring { service: String },
    Ephemeral,
}

/// The salt/pepper pair used by an encrypted mapping.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub salt: KeyHandle,
    pub pepper: KeyHandle,
    pub origin: KeyOrigin,
}

impl KeyMaterial {
    pub fn generate() -> Self {
        Self {
            salt: KeyHandle::generate("salt"),
            pepper: KeyHandle::generate("pepper"),
            origin: KeyOrigin::Ephemeral,
        }
    }

    /// Resolve key material from a key directory: direct `Salt.key` and
    /// `Pepper.key` first, then the `Key.dir` pointer.
    pub fn load_from_dir(dir: &Path) -> Result<Self, KeyError> {
        let salt = dir.join(SALT_FILE);
        let pepper = dir.join(PEPPER_FILE);
        if salt.is_file() && pepper.is_file() {
            debug!(dir = %dir.display(), "loading key files");
            return Self::load_pair(&salt, &pepper);
        }

        let pointer = dir.join(POINTER_FILE);
        if pointer.is_file() {
            debug!(pointer = %pointer.display(), "resolving key pointer");
            return KeyPointer::read_file(&pointer)?.resolve();
        }

        Err(KeyError::Missing {
            location: dir.display().to_string(),
        })
    }

    pub fn load_pair(salt: &Path, pepper: &Path) -> Result<Self, KeyError> {
        Ok(Self {
            salt: KeyHandle::read_file(salt)?,
            pepper: KeyHandle::read_file(pepper)?,
            origin: KeyOrigin::Files {
                salt: salt.to_path_buf(),
                pepper: pepper.to_path_buf(),
            },
        })
    }

    /// Write `Salt.key` and `Pepper.key` into `dir`. Returns a pointer to them.
    pub fn write_to_dir(&self, dir: &Path) -> Result<KeyPointer, KeyError> {
        let pointer = KeyPointer::new(dir.join(SALT_FILE), dir.join(PEPPER_FILE));
        for path in [&pointer.salt, &pointer.pepper] {
            if path.exists() {
                return Err(KeyError::AlreadyExists { path: path.clone() });
            }
        }
        self.salt.write_file(&pointer.salt)?;
        self.pepper.write_file(&pointer.pepper)?;
        Ok(pointer)
    }

    /// Key files on disk, if the material was loaded from files.
    pub fn files(&self) -> Option<(&Path, &Path)> {
        match &self.origin {
            KeyOrigin::Files { salt, pepper } => Some((salt, pepper)),
            _ => None,
        }
    }
}

/// Provides the salt/pepper pair for a mapping.
pub trait KeySource: Send + Sync {
    fn load(&self) -> Result<KeyMaterial, KeyError>;
}

/// Key files in a fixed directory (`Salt.key` + `Pepper.key`, or `Key.dir`).
#[derive(Debug, Clone)]
pub struct KeyDirectory {
    dir: PathBuf,
}

impl KeyDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl KeySource for KeyDirectory {
    fn load(&self) -> Result<KeyMaterial, KeyError> {
        KeyMaterial::load_from_dir(&self.dir)
    }
}

/// OS keyring-backed source. Creates both keys on first use.
pub struct KeyringKeySource {
    service: String,
}

impl KeyringKeySource {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn get_or_create(&self, alias: &str) -> Result<KeyHandle, KeyError> {
        // Keyring operations are synchronous and may prompt the user on some platforms.
        let entry = keyring::Entry::new(&self.service, alias)
            .map_err(|e| KeyError::Keyring(e.to_string()))?;
        if let Ok(secret) = entry.get_password() {
            let bytes = decode_key(&secret).map_err(KeyError::Keyring)?;
            return Ok(KeyHandle::new(alias, bytes));
        }

        let handle = KeyHandle::generate(alias);
        entry
            .set_password(&encode_key(handle.as_bytes()))
            .map_err(|e| KeyError::Keyring(e.to_string()))?;
        Ok(handle)
    }
}

impl KeySource for KeyringKeySource {
    fn load(&self) -> Result<KeyMaterial, KeyError> {
        Ok(KeyMaterial {
            salt: self.get_or_create("salt")?,
            pepper: self.get_or_create("pepper")?,
            origin: KeyOrigin::Keyring {
                service: self.service.clone(),
            },
        })
    }
}

/// In-memory key source for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeySource {
    inner: Arc<Mutex<Option<KeyMaterial>>>,
}

impl KeySource for InMemoryKeySource {
    fn load(&self) -> Result<KeyMaterial, KeyError> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get_or_insert_with(KeyMaterial::generate).clone())
    }
}

fn encode_key(bytes: &[u8; KEY_LEN]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn decode_key(secret: &str) -> Result<[u8; KEY_LEN], String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(secret.trim())
        .map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("expected {KEY_LEN} bytes, got {}", b.len()))
}

fn write_new_private(path: &Path, body: &[u8]) -> Result<(), KeyError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::AlreadyExists {
            KeyError::AlreadyExists {
                path: path.to_path_buf(),
            }
        } else {
            KeyError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    file.write_all(body)
        .and_then(|_| file.sync_all())
        .map_err(|source| KeyError::Io {
            path: path.to_path_buf(),
            source,
        })
}
