use std::{path::PathBuf, time::Duration};

use crate::error::MappingError;

pub const DEFAULT_EXT: &str = "db";

/// Construction parameters for a file-backed mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingOptions {
    /// Directory holding the backing file. Must already exist.
    pub file_dir: PathBuf,
    /// Base name of the backing file; no `.` or path separators.
    pub file_name_prefix: String,
    /// Extension of the backing file; no `.`.
    pub file_ext: String,
    /// Apply the salt/pepper encryption layers when writing.
    pub encrypt: bool,
    /// Upper bound on waiting for the cross-process lock. `None` blocks.
    pub lock_timeout: Option<Duration>,
}

impl MappingOptions {
    pub fn new(file_dir: impl Into<PathBuf>, file_name_prefix: impl Into<String>) -> Self {
        Self {
            file_dir: file_dir.into(),
            file_name_prefix: file_name_prefix.into(),
            file_ext: DEFAULT_EXT.to_string(),
            encrypt: true,
            lock_timeout: None,
        }
    }

    pub fn ext(mut self, ext: impl Into<String>) -> Self {
        self.file_ext = ext.into();
        self
    }

    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), MappingError> {
        if !self.file_dir.is_dir() {
            return Err(MappingError::Configuration(format!(
                "directory {} does not exist",
                self.file_dir.display()
            )));
        }
        check_component("file_name_prefix", &self.file_name_prefix)?;
        check_component("file_ext", &self.file_ext)?;
        if self.file_ext == "lock" {
            return Err(MappingError::Configuration(
                "file_ext 'lock' collides with the lock file".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_component(name: &str, value: &str) -> Result<(), MappingError> {
    if value.is_empty() {
        return Err(MappingError::Configuration(format!("{name} must not be empty")));
    }
    if value.contains(['.', '/', '\\']) {
        return Err(MappingError::Configuration(format!(
            "{name} '{value}' must not contain '.' or path separators"
        )));
    }
    Ok(())
}
