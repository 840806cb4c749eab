use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "vaultmap",
    about = "Encrypted local key/value store",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Backing file prefix; overrides `store.prefix` from the config file.
    #[arg(long, global = true)]
    pub prefix: Option<String>,

    /// Optional subcommand; defaults to listing keys when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the value stored under a key.
    Get { key: String },
    /// Store a value. Parsed as JSON unless `--text` is given.
    Set {
        key: String,
        value: String,
        #[arg(long)]
        text: bool,
    },
    /// Delete a key.
    Delete { key: String },
    /// List stored keys.
    List,
    /// Delete the backing file and every entry in it.
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Copy the backing file (and optionally the key files) into a directory.
    Backup {
        dir: PathBuf,
        #[arg(long)]
        include_keys: bool,
    },
    /// Manage salt/pepper key files.
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Run a write/read/delete probe against the configured store.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum KeysCommand {
    /// Generate Salt.key and Pepper.key in the key directory.
    Init,
    /// Point the key directory at key files stored elsewhere (writes Key.dir).
    Link { salt: PathBuf, pepper: PathBuf },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
