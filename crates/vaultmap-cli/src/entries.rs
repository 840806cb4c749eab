use std::path::Path;

use color_eyre::Result;
use vaultmap_core::{storage::SnapshotStore, Value};
use vaultmap_storage::EncryptedMapping;

/// Parse a CLI value: JSON when possible, otherwise (or with `text`) a plain string.
pub fn parse_value(raw: &str, text: bool) -> Value {
    if text {
        return Value::from(raw);
    }
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
    if !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && trimmed.parse::<i64>().is_err()
    {
        // Out of i64 range; JSON parsing would round it to a float.
        return Value::from(trimmed);
    }
    serde_json::from_str::<serde_json::Value>(raw)
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(raw))
}

pub fn get<S: SnapshotStore>(mapping: &EncryptedMapping<S>, key: &str) -> Result<String> {
    match mapping.get_crypt(key)? {
        Some(value) => Ok(value.to_string()),
        None => color_eyre::eyre::bail!("no entry for key '{key}'"),
    }
}

pub fn set<S: SnapshotStore>(
    mapping: &EncryptedMapping<S>,
    key: &str,
    raw: &str,
    text: bool,
) -> Result<String> {
    mapping.set(key, parse_value(raw, text));
    mapping.sync()?;
    Ok(format!("Stored '{key}'"))
}

pub fn delete<S: SnapshotStore>(mapping: &EncryptedMapping<S>, key: &str) -> Result<String> {
    let existed = mapping.delete(key).is_some();
    mapping.sync()?;
    Ok(if existed {
        format!("Deleted '{key}'")
    } else {
        format!("No entry for '{key}'")
    })
}

pub fn list<S: SnapshotStore>(mapping: &EncryptedMapping<S>) -> Vec<String> {
    mapping.keys()
}

pub fn clear<S: SnapshotStore>(mapping: &EncryptedMapping<S>, yes: bool) -> Result<String> {
    if !yes {
        color_eyre::eyre::bail!("refusing to clear {} without --yes", mapping.location());
    }
    mapping.clear()?;
    Ok("Store cleared".to_string())
}

/// Key files, when included, come from wherever the loaded keys were read.
pub fn backup(mapping: &EncryptedMapping, dir: &Path, include_keys: bool) -> Result<String> {
    let copied = mapping.backup(dir, include_keys, None)?;
    Ok(format!("Backup written to {}", copied.display()))
}
