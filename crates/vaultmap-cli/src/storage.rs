use std::{fs, path::PathBuf, time::Duration};

use color_eyre::Result;
use dirs::{config_dir, data_dir};
use tracing::debug;
use vaultmap_storage::{
    key_material::{KeyDirectory, KeySource, KeyringKeySource},
    EncryptedMapping, MappingOptions,
};

use crate::config::{Config, KeySourceKind};

const DEFAULT_PREFIX: &str = "vault";
const KEYRING_SERVICE: &str = "vaultmap";

/// Resolve the default data directory for vaultmap.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("vaultmap"))
}

/// Resolve the default key directory for vaultmap.
pub fn default_key_dir() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("vaultmap").join("keys"))
}

pub fn key_dir(config: &Config) -> Result<PathBuf> {
    match &config.key_dir {
        Some(dir) => Ok(dir.clone()),
        None => default_key_dir(),
    }
}

/// Mapping options from config, creating the data directory if needed.
pub fn options_from_config(config: &Config, prefix: Option<&str>) -> Result<MappingOptions> {
    let dir = match &config.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    fs::create_dir_all(&dir)?;

    let prefix = prefix
        .or(config.store.prefix.as_deref())
        .unwrap_or(DEFAULT_PREFIX);
    let mut options = MappingOptions::new(dir, prefix);
    if let Some(ext) = &config.store.ext {
        options = options.ext(ext.clone());
    }
    if let Some(encrypt) = config.store.encrypt {
        options = options.encrypt(encrypt);
    }
    if let Some(ms) = config.store.lock_timeout_ms {
        options = options.lock_timeout(Duration::from_millis(ms));
    }
    Ok(options)
}

pub fn key_source(config: &Config) -> Result<Box<dyn KeySource>> {
    Ok(match config.key_source {
        KeySourceKind::Files => Box::new(KeyDirectory::new(key_dir(config)?)),
        KeySourceKind::Keyring => Box::new(KeyringKeySource::new(KEYRING_SERVICE)),
    })
}

/// Open the configured mapping.
pub fn open_from_config(config: &Config, prefix: Option<&str>) -> Result<EncryptedMapping> {
    let options = options_from_config(config, prefix)?;
    debug!(dir = %options.file_dir.display(), prefix = %options.file_name_prefix, "opening mapping");
    let source = key_source(config)?;
    Ok(EncryptedMapping::open_with_source(options, source.as_ref())?)
}
