use std::{fs, path::PathBuf};

use color_eyre::Result;
use tracing::info;
use vaultmap_storage::key_material::{KeyMaterial, KeyPointer};

use crate::{cli::KeysCommand, config::Config, storage};

pub fn handle(cmd: KeysCommand, config: &Config) -> Result<()> {
    match cmd {
        KeysCommand::Init => {
            let dir = init(config)?;
            println!("Generated Salt.key and Pepper.key in {}", dir.display());
        }
        KeysCommand::Link { salt, pepper } => {
            let pointer = link(config, salt, pepper)?;
            println!("Key pointer written to {}", pointer.display());
        }
    }
    Ok(())
}

/// Generate a fresh salt/pepper pair in the configured key directory.
pub fn init(config: &Config) -> Result<PathBuf> {
    let dir = storage::key_dir(config)?;
    fs::create_dir_all(&dir)?;
    KeyMaterial::generate().write_to_dir(&dir)?;
    info!(dir = %dir.display(), "key files generated");
    Ok(dir)
}

/// Write `Key.dir` pointing at existing key files. The files are loaded first
/// so a broken pointer is never written.
pub fn link(config: &Config, salt: PathBuf, pepper: PathBuf) -> Result<PathBuf> {
    let dir = storage::key_dir(config)?;
    fs::create_dir_all(&dir)?;
    let pointer = KeyPointer::new(fs::canonicalize(salt)?, fs::canonicalize(pepper)?);
    pointer.resolve()?;
    Ok(pointer.write_to_dir(&dir)?)
}
