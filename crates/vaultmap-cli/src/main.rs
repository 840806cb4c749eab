mod cli;
mod config;
mod entries;
mod keys;
mod storage;

use crate::cli::{Command, ConfigCommand};
use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vaultmap_core::Value;
use vaultmap_storage::{key_material::KeySource, EncryptedMapping, MappingOptions};

const HEALTH_KEY: &str = "__health__/probe";

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    let prefix = cli.prefix.as_deref();
    match cli.command.unwrap_or(Command::List) {
        Command::Version => print_version(),
        Command::Health => run_health_check(&config, prefix)?,
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        Command::Keys(cmd) => keys::handle(cmd, &config)?,
        Command::Get { key } => {
            let mapping = storage::open_from_config(&config, prefix)?;
            println!("{}", entries::get(&mapping, &key)?);
        }
        Command::Set { key, value, text } => {
            let mapping = storage::open_from_config(&config, prefix)?;
            println!("{}", entries::set(&mapping, &key, &value, text)?);
        }
        Command::Delete { key } => {
            let mapping = storage::open_from_config(&config, prefix)?;
            println!("{}", entries::delete(&mapping, &key)?);
        }
        Command::List => {
            let mapping = storage::open_from_config(&config, prefix)?;
            let keys = entries::list(&mapping);
            if keys.is_empty() {
                println!("No entries yet. Add one with `vaultmap set <key> <value>`.");
            }
            for key in keys {
                println!("{key}");
            }
        }
        Command::Clear { yes } => {
            let mapping = storage::open_from_config(&config, prefix)?;
            println!("{}", entries::clear(&mapping, yes)?);
        }
        Command::Backup { dir, include_keys } => {
            let mapping = storage::open_from_config(&config, prefix)?;
            println!("{}", entries::backup(&mapping, &dir, include_keys)?);
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("vaultmap {}", env!("CARGO_PKG_VERSION"));
}

/// Runs a write/reopen/read/delete probe against the configured store.
fn run_health_check(config: &config::Config, prefix: Option<&str>) -> Result<()> {
    let options = storage::options_from_config(config, prefix)?;
    let source = storage::key_source(config)?;
    run_store_health(&options, source.as_ref())?;
    println!("Storage: ok");
    Ok(())
}

fn run_store_health(options: &MappingOptions, source: &dyn KeySource) -> Result<()> {
    let payload = Value::from("ok");
    {
        let mapping = EncryptedMapping::open_with_source(options.clone(), source)?;
        mapping.set(HEALTH_KEY, payload.clone());
        mapping.close()?;
    }

    let mapping = EncryptedMapping::open_with_source(options.clone(), source)?;
    let round_trip = mapping.get(HEALTH_KEY);
    mapping.delete(HEALTH_KEY);
    mapping.close()?;

    if round_trip != Some(payload) {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
