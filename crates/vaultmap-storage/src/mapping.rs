//! Encrypted, file-backed key/value mapping.
//!
//! Mutations only touch the in-memory entries and a change-log. [`EncryptedMapping::sync`]
//! takes the snapshot lock, re-reads the persisted snapshot, replays the change-log on
//! top of it and atomically writes the merged result back, so keys written by other
//! holders of the same file survive unless this mapping deleted them.
//!
//! The snapshot lock is held for the whole read-merge-write cycle, which closes the
//! lost-update window between two processes syncing at once.

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, error, info, instrument, warn};
use vaultmap_core::{storage::SnapshotStore, Value};

use crate::{
    crypt::{self, CryptError},
    error::MappingError,
    file_store::FileSnapshotStore,
    key_material::{KeyMaterial, KeySource, PEPPER_FILE, SALT_FILE},
    options::MappingOptions,
    record::{EncryptedRecord, RecordError},
};

const SYNC_ATTEMPTS: u32 = 2;

/// Pending change for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Upsert,
    Remove,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Value>,
    changes: BTreeMap<String, Change>,
}

/// Key/value mapping over a [`SnapshotStore`], optionally encrypted.
///
/// All methods take `&self`, so one mapping can be shared across threads
/// behind an `Arc`. Pending changes are flushed on `Drop`, which for a shared
/// mapping only happens when the last `Arc` is released; call
/// [`EncryptedMapping::sync`] to persist earlier.
pub struct EncryptedMapping<S: SnapshotStore = FileSnapshotStore> {
    store: S,
    keys: Option<KeyMaterial>,
    encrypt: bool,
    state: Mutex<State>,
}

impl EncryptedMapping<FileSnapshotStore> {
    /// Open the mapping at `<file_dir>/<prefix>.<ext>` and pull any existing snapshot.
    #[instrument(skip_all, fields(dir = %options.file_dir.display(), prefix = %options.file_name_prefix))]
    pub fn open(options: MappingOptions, keys: Option<KeyMaterial>) -> Result<Self, MappingError> {
        options.validate()?;
        let store = FileSnapshotStore::new(
            &options.file_dir,
            &options.file_name_prefix,
            &options.file_ext,
            options.lock_timeout,
        )?;
        Self::with_store(store, options.encrypt, keys)
    }

    /// Like [`EncryptedMapping::open`], loading keys from `source` when encryption is on.
    pub fn open_with_source(
        options: MappingOptions,
        source: &dyn KeySource,
    ) -> Result<Self, MappingError> {
        options.validate()?;
        let keys = if options.encrypt {
            Some(source.load()?)
        } else {
            None
        };
        Self::open(options, keys)
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Copy the backing file, and optionally the key files, into `dir`.
    ///
    /// Key files come from `key_dir` when given, otherwise from the files the
    /// loaded key material was read from.
    #[instrument(skip_all, fields(dir = %dir.display(), include_keys = include_keys))]
    pub fn backup(
        &self,
        dir: &Path,
        include_keys: bool,
        key_dir: Option<&Path>,
    ) -> Result<PathBuf, MappingError> {
        if !dir.is_dir() {
            return Err(MappingError::Configuration(format!(
                "backup directory {} does not exist",
                dir.display()
            )));
        }
        let copied = self.store.backup_to(dir)?;

        if include_keys {
            let (salt, pepper) = match key_dir {
                Some(key_dir) => (key_dir.join(SALT_FILE), key_dir.join(PEPPER_FILE)),
                None => self
                    .keys
                    .as_ref()
                    .and_then(KeyMaterial::files)
                    .map(|(s, p)| (s.to_path_buf(), p.to_path_buf()))
                    .ok_or_else(|| {
                        MappingError::Configuration(
                            "key material was not loaded from files; pass a key directory"
                                .to_string(),
                        )
                    })?,
            };
            for (src, name) in [(salt, SALT_FILE), (pepper, PEPPER_FILE)] {
                if !src.is_file() {
                    return Err(MappingError::Configuration(format!(
                        "key file {} does not exist",
                        src.display()
                    )));
                }
                fs::copy(&src, dir.join(name)).map_err(|source| MappingError::Io {
                    location: src.display().to_string(),
                    source,
                })?;
            }
        }

        info!(backup = %copied.display(), "backup written");
        Ok(copied)
    }
}

impl<S: SnapshotStore> EncryptedMapping<S> {
    /// Build a mapping over any snapshot store and perform the initial sync.
    pub fn with_store(
        store: S,
        encrypt: bool,
        keys: Option<KeyMaterial>,
    ) -> Result<Self, MappingError> {
        if encrypt && keys.is_none() {
            return Err(MappingError::Configuration(
                "encryption is enabled but no key material was provided".to_string(),
            ));
        }
        let mapping = Self {
            store,
            keys,
            encrypt,
            state: Mutex::new(State::default()),
        };
        mapping.sync()?;
        debug!(location = %mapping.store.location(), entries = mapping.len(), "mapping opened");
        Ok(mapping)
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypt
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    /// Snapshot of the current entries in key order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.state()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn iter(&self) -> std::vec::IntoIter<(String, Value)> {
        self.entries().into_iter()
    }

    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.state().entries.clone()
    }

    /// Number of buffered changes not yet synced.
    pub fn pending(&self) -> usize {
        self.state().changes.len()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let mut state = self.state();
        state.changes.insert(key.clone(), Change::Upsert);
        state.entries.insert(key, value.into());
    }

    /// Remove `key` locally and schedule its deletion on disk. The deletion is
    /// recorded even when the key is not held in memory, so entries written by
    /// other holders since the last sync can be deleted too.
    pub fn delete(&self, key: &str) -> Option<Value> {
        let mut state = self.state();
        state.changes.insert(key.to_string(), Change::Remove);
        state.entries.remove(key)
    }

    pub fn pop(&self, key: &str) -> Result<Value, MappingError> {
        let mut state = self.state();
        let value = state
            .entries
            .remove(key)
            .ok_or_else(|| MappingError::KeyNotFound {
                key: key.to_string(),
            })?;
        state.changes.insert(key.to_string(), Change::Remove);
        Ok(value)
    }

    pub fn pop_or(&self, key: &str, default: impl Into<Value>) -> Value {
        self.pop(key).unwrap_or_else(|_| default.into())
    }

    /// Remove and return the entry with the greatest key.
    pub fn popitem(&self) -> Result<(String, Value), MappingError> {
        let mut state = self.state();
        let (key, value) = state.entries.pop_last().ok_or(MappingError::Empty)?;
        state.changes.insert(key.clone(), Change::Remove);
        Ok((key, value))
    }

    /// Upsert every entry in iteration order.
    pub fn update<I, K, V>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut state = self.state();
        for (key, value) in entries {
            let key = key.into();
            state.changes.insert(key.clone(), Change::Upsert);
            state.entries.insert(key, value.into());
        }
    }

    /// Return the value for `key`, inserting `default` first if absent.
    pub fn setdefault(&self, key: impl Into<String>, default: impl Into<Value>) -> Value {
        let key = key.into();
        let mut state = self.state();
        if let Some(existing) = state.entries.get(&key) {
            return existing.clone();
        }
        let value = default.into();
        state.changes.insert(key.clone(), Change::Upsert);
        state.entries.insert(key, value.clone());
        value
    }

    /// Store `value` sealed with the salt key; it stays ciphertext in memory
    /// and in every snapshot until read back with [`EncryptedMapping::get_crypt`].
    pub fn set_crypt(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), MappingError> {
        let keys = self.require_keys("set_crypt")?;
        let value: Value = value.into();
        let sealed = crypt::seal(&keys.salt, &value)
            .map_err(|e| MappingError::Encoding(e.to_string()))?;
        self.set(key, Value::Sealed(sealed));
        Ok(())
    }

    /// Read a value, opening it if it was stored with `set_crypt`.
    pub fn get_crypt(&self, key: &str) -> Result<Option<Value>, MappingError> {
        match self.get(key) {
            Some(Value::Sealed(bytes)) => {
                let keys = self.require_keys("get_crypt")?;
                crypt::open(&keys.salt, &bytes)
                    .map(Some)
                    .map_err(|e| MappingError::Decryption {
                        location: format!("{}#{key}", self.store.location()),
                        reason: e.to_string(),
                    })
            }
            other => Ok(other),
        }
    }

    /// Delete the backing snapshot right away and forget all state, including
    /// buffered changes.
    #[instrument(skip_all, fields(location = %self.store.location()))]
    pub fn clear(&self) -> Result<(), MappingError> {
        let mut state = self.state();
        let _guard = self.store.lock()?;
        self.store.remove()?;
        state.entries.clear();
        state.changes.clear();
        info!("mapping cleared");
        Ok(())
    }

    /// Merge buffered changes into the persisted snapshot and reload from it.
    ///
    /// A failed cycle is retried once; if the retry fails too the last error is
    /// returned wrapped in [`MappingError::Sync`].
    #[instrument(skip_all, fields(location = %self.store.location()))]
    pub fn sync(&self) -> Result<(), MappingError> {
        let mut state = self.state();
        match self.sync_once(&mut state) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "sync failed, retrying once");
                self.sync_once(&mut state).map_err(|last| {
                    error!(error = %last, "sync failed after retry");
                    MappingError::Sync {
                        attempts: SYNC_ATTEMPTS,
                        source: Box::new(last),
                    }
                })
            }
        }
    }

    /// Flush pending changes and release the mapping.
    ///
    /// On failure the error is returned and the unsaved changes are dropped,
    /// so `Drop` does not try to flush them again.
    pub fn close(self) -> Result<(), MappingError> {
        let result = self.sync();
        if result.is_err() {
            self.state().changes.clear();
        }
        result
    }

    fn sync_once(&self, state: &mut State) -> Result<(), MappingError> {
        let _guard = self.store.lock()?;
        let (mut merged, disk_encrypted) = self.read_snapshot()?;

        for (key, change) in &state.changes {
            match change {
                Change::Upsert => {
                    if let Some(value) = state.entries.get(key) {
                        merged.insert(key.clone(), value.clone());
                    }
                }
                Change::Remove => {
                    merged.remove(key);
                }
            }
        }

        if !state.changes.is_empty() || disk_encrypted != Some(self.encrypt) {
            let keys = if self.encrypt { self.keys.as_ref() } else { None };
            let bytes = EncryptedRecord::encode(&merged, keys)
                .and_then(|record| record.to_bytes())
                .map_err(|e| self.record_err(e))?;
            self.store.replace(&bytes)?;
            debug!(
                entries = merged.len(),
                changes = state.changes.len(),
                "snapshot written"
            );
        }

        state.entries = merged;
        state.changes.clear();
        Ok(())
    }

    /// Current snapshot plus its encryption flag (`None` when no snapshot exists).
    fn read_snapshot(&self) -> Result<(BTreeMap<String, Value>, Option<bool>), MappingError> {
        let Some(bytes) = self.store.read()? else {
            return Ok((BTreeMap::new(), None));
        };
        let record = EncryptedRecord::from_bytes(&bytes).map_err(|e| self.record_err(e))?;
        let entries = record
            .decode(self.keys.as_ref())
            .map_err(|e| self.record_err(e))?;
        Ok((entries, Some(record.encrypted)))
    }

    fn record_err(&self, err: RecordError) -> MappingError {
        match err {
            RecordError::Crypt(CryptError::Encrypt(reason) | CryptError::Encoding(reason)) => {
                MappingError::Encoding(reason)
            }
            other => MappingError::Decryption {
                location: self.store.location(),
                reason: other.to_string(),
            },
        }
    }

    fn require_keys(&self, op: &str) -> Result<&KeyMaterial, MappingError> {
        self.keys
            .as_ref()
            .ok_or_else(|| MappingError::Configuration(format!("{op} requires key material")))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: SnapshotStore> fmt::Debug for EncryptedMapping<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("EncryptedMapping")
            .field("location", &self.store.location())
            .field("encrypt", &self.encrypt)
            .field("entries", &state.entries.len())
            .field("pending", &state.changes.len())
            .finish()
    }
}

impl<S: SnapshotStore> Drop for EncryptedMapping<S> {
    fn drop(&mut self) {
        if self.pending() == 0 {
            return;
        }
        if let Err(err) = self.sync() {
            warn!(location = %self.store.location(), error = %err, "flush on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use vaultmap_core::storage::{InMemorySnapshotStore, StoreError};

    use super::*;
    use crate::key_material::InMemoryKeySource;

    fn opts(dir: &Path) -> MappingOptions {
        MappingOptions::new(dir, "cfg")
    }

    fn open(dir: &Path, keys: &KeyMaterial) -> EncryptedMapping {
        EncryptedMapping::open(opts(dir), Some(keys.clone())).expect("open")
    }

    #[test]
    fn reopened_mapping_sees_synced_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();

        let mapping = open(dir.path(), &keys);
        mapping.update([("a", Value::Int(1)), ("b", Value::from("x"))]);
        mapping.sync().expect("sync");
        drop(mapping);

        let reopened = open(dir.path(), &keys);
        assert_eq!(reopened.get("a"), Some(Value::Int(1)));
        assert_eq!(reopened.get("b"), Some(Value::from("x")));
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn drop_flushes_pending_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        {
            let mapping = open(dir.path(), &keys);
            mapping.set("token", "abc");
            assert_eq!(mapping.pending(), 1);
        }
        assert_eq!(open(dir.path(), &keys).get("token"), Some(Value::from("abc")));
    }

    #[test]
    fn shared_mapping_flushes_when_last_handle_drops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        let mapping = Arc::new(open(dir.path(), &keys));
        let clone = Arc::clone(&mapping);
        mapping.set("token", "abc");

        drop(clone);
        assert_eq!(open(dir.path(), &keys).get("token"), None);

        drop(mapping);
        assert_eq!(open(dir.path(), &keys).get("token"), Some(Value::from("abc")));
    }

    #[test]
    fn close_flushes_and_reports_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        let mapping = open(dir.path(), &keys);
        mapping.set("k", 5);
        mapping.close().expect("close");
        assert_eq!(open(dir.path(), &keys).get("k"), Some(Value::Int(5)));
    }

    #[test]
    fn non_finite_floats_keep_the_store_readable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        let mapping = open(dir.path(), &keys);
        mapping.set("ok", 1);
        mapping.set("nan", f64::NAN);
        mapping.set("inf", f64::INFINITY);
        mapping.sync().expect("sync");

        mapping.set("other", 2);
        mapping.sync().expect("later sync");
        drop(mapping);

        let reopened = open(dir.path(), &keys);
        assert!(matches!(reopened.get("nan"), Some(Value::Float(f)) if f.is_nan()));
        assert_eq!(reopened.get("inf"), Some(Value::Float(f64::INFINITY)));
        assert_eq!(reopened.get("other"), Some(Value::Int(2)));
    }

    #[test]
    fn sync_without_changes_leaves_file_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        let mapping = open(dir.path(), &keys);
        mapping.set("a", 1);
        mapping.sync().expect("sync");
        let before = fs::read(mapping.path()).expect("read");

        mapping.sync().expect("sync again");
        mapping.sync().expect("and again");
        assert_eq!(fs::read(mapping.path()).expect("read"), before);
        assert_eq!(mapping.to_map(), BTreeMap::from([("a".to_string(), Value::Int(1))]));
    }

    #[test]
    fn deleted_keys_stay_deleted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        let mapping = open(dir.path(), &keys);
        mapping.set("gone", true);
        mapping.sync().expect("sync");
        assert_eq!(mapping.delete("gone"), Some(Value::Bool(true)));
        mapping.sync().expect("sync");

        assert!(!open(dir.path(), &keys).contains("gone"));
    }

    #[test]
    fn concurrent_writers_merge_instead_of_overwriting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        let first = open(dir.path(), &keys);
        let second = open(dir.path(), &keys);

        second.set("k2", "from-second");
        second.sync().expect("second sync");

        first.set("k1", "from-first");
        first.sync().expect("first sync");

        assert_eq!(first.get("k2"), Some(Value::from("from-second")));
        let fresh = open(dir.path(), &keys);
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh.get("k1"), Some(Value::from("from-first")));
    }

    #[test]
    fn deletion_applies_to_keys_written_elsewhere() {
        let store = InMemorySnapshotStore::new();
        let keys = KeyMaterial::generate();
        let first = EncryptedMapping::with_store(store.clone(), true, Some(keys.clone()))
            .expect("open first");
        let second =
            EncryptedMapping::with_store(store.clone(), true, Some(keys.clone())).expect("open");

        second.set("k2", 2);
        second.sync().expect("sync");

        assert_eq!(first.delete("k2"), None);
        first.set("k1", 1);
        first.sync().expect("sync");

        assert_eq!(first.keys(), vec!["k1".to_string()]);
        second.sync().expect("resync");
        assert!(!second.contains("k2"));
    }

    #[test]
    fn backing_file_never_contains_plaintext() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        let mapping = open(dir.path(), &keys);
        mapping.set("api-token", "s3cr3t-plaintext-value");
        mapping.sync().expect("sync");

        let raw = fs::read(mapping.path()).expect("read");
        let text = String::from_utf8_lossy(&raw);
        assert!(!text.contains("s3cr3t-plaintext-value"));
        assert!(!text.contains("api-token"));
    }

    #[test]
    fn constructor_rejects_invalid_options() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();

        let dotted = EncryptedMapping::open(
            MappingOptions::new(dir.path(), "cfg.main"),
            Some(keys.clone()),
        );
        assert!(matches!(dotted, Err(MappingError::Configuration(_))));

        let missing = EncryptedMapping::open(opts(&dir.path().join("nope")), Some(keys));
        assert!(matches!(missing, Err(MappingError::Configuration(_))));

        let keyless = EncryptedMapping::open(opts(dir.path()), None);
        assert!(matches!(keyless, Err(MappingError::Configuration(_))));
    }

    #[test]
    fn open_with_source_loads_keys_only_when_encrypting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = InMemoryKeySource::default();
        let mapping = EncryptedMapping::open_with_source(opts(dir.path()), &source).expect("open");
        mapping.set("a", 1);
        mapping.close().expect("close");

        let again = EncryptedMapping::open_with_source(opts(dir.path()), &source).expect("open");
        assert_eq!(again.get("a"), Some(Value::Int(1)));

        let empty_keys = tempfile::tempdir().expect("tempdir");
        let err = EncryptedMapping::open_with_source(
            opts(dir.path()),
            &crate::key_material::KeyDirectory::new(empty_keys.path()),
        )
        .expect_err("no keys on disk");
        assert!(matches!(err, MappingError::Configuration(_)));
    }

    #[test]
    fn pop_and_popitem_follow_mapping_semantics() {
        let store = InMemorySnapshotStore::new();
        let mapping =
            EncryptedMapping::with_store(store, false, None).expect("open unencrypted");

        assert!(matches!(
            mapping.pop("missing"),
            Err(MappingError::KeyNotFound { ref key }) if key == "missing"
        ));
        assert_eq!(mapping.pop_or("missing", 9), Value::Int(9));
        assert_eq!(mapping.pending(), 0);
        assert!(matches!(mapping.popitem(), Err(MappingError::Empty)));

        mapping.update([("a", 1), ("c", 3), ("b", 2)]);
        assert_eq!(mapping.pop("a").expect("pop"), Value::Int(1));
        assert_eq!(mapping.popitem().expect("popitem"), ("c".to_string(), Value::Int(3)));
        assert_eq!(mapping.len(), 1);
        mapping.sync().expect("sync");
        assert_eq!(mapping.entries(), vec![("b".to_string(), Value::Int(2))]);
    }

    #[test]
    fn update_applies_in_order_and_setdefault_keeps_existing() {
        let mapping =
            EncryptedMapping::with_store(InMemorySnapshotStore::new(), false, None).expect("open");
        mapping.update(vec![("k", Value::Int(1)), ("k", Value::Int(2))]);
        assert_eq!(mapping.get("k"), Some(Value::Int(2)));

        assert_eq!(mapping.setdefault("k", 7), Value::Int(2));
        assert_eq!(mapping.setdefault("fresh", "v"), Value::from("v"));
        assert_eq!(mapping.iter().count(), 2);
    }

    #[test]
    fn clear_removes_backing_file_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        let mapping = open(dir.path(), &keys);
        mapping.set("a", 1);
        mapping.sync().expect("sync");
        mapping.set("pending", 2);

        mapping.clear().expect("clear");
        assert!(!mapping.path().exists());
        assert!(mapping.is_empty());
        assert_eq!(mapping.pending(), 0);
        drop(mapping);

        assert!(open(dir.path(), &keys).is_empty());
    }

    #[test]
    fn unencrypted_store_is_readable_and_upgrades_when_keys_arrive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plain = EncryptedMapping::open(opts(dir.path()).encrypt(false), None).expect("open");
        plain.set("name", "visible-value");
        plain.close().expect("close");
        let raw = fs::read_to_string(dir.path().join("cfg.db")).expect("read");
        assert!(raw.contains("\"encrypted\":false"));

        let keys = KeyMaterial::generate();
        let upgraded = open(dir.path(), &keys);
        assert_eq!(upgraded.get("name"), Some(Value::from("visible-value")));
        let raw = fs::read(upgraded.path()).expect("read");
        assert!(!String::from_utf8_lossy(&raw).contains("visible-value"));
    }

    #[test]
    fn wrong_keys_surface_as_decryption_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mapping = open(dir.path(), &KeyMaterial::generate());
        mapping.set("a", 1);
        mapping.close().expect("close");

        let err = EncryptedMapping::open(opts(dir.path()), Some(KeyMaterial::generate()))
            .expect_err("other keys");
        let MappingError::Sync { attempts, .. } = &err else {
            panic!("expected sync error, got {err:?}");
        };
        assert_eq!(*attempts, 2);
        assert!(matches!(err.root_cause(), MappingError::Decryption { .. }));
    }

    #[test]
    fn corrupt_backing_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("cfg.db"), b"{not a record").expect("write");
        let err = EncryptedMapping::open(opts(dir.path()), Some(KeyMaterial::generate()))
            .expect_err("corrupt");
        assert!(matches!(err.root_cause(), MappingError::Decryption { .. }));
    }

    #[test]
    fn sealed_values_stay_encrypted_in_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        let mapping = open(dir.path(), &keys);
        mapping.set_crypt("password", "hunter2").expect("set_crypt");
        mapping.set("plain", 1);

        assert!(mapping.get("password").is_some_and(|v| v.is_sealed()));
        assert_eq!(
            mapping.get_crypt("password").expect("get_crypt"),
            Some(Value::from("hunter2"))
        );
        assert_eq!(mapping.get_crypt("plain").expect("plain"), Some(Value::Int(1)));
        assert_eq!(mapping.get_crypt("missing").expect("missing"), None);
        mapping.close().expect("close");

        let reopened = open(dir.path(), &keys);
        assert_eq!(
            reopened.get_crypt("password").expect("get_crypt"),
            Some(Value::from("hunter2"))
        );

        let keyless =
            EncryptedMapping::with_store(InMemorySnapshotStore::new(), false, None).expect("open");
        assert!(matches!(
            keyless.set_crypt("x", 1),
            Err(MappingError::Configuration(_))
        ));
    }

    #[test]
    fn backup_copies_data_and_optionally_keys() {
        let data = tempfile::tempdir().expect("tempdir");
        let key_dir = tempfile::tempdir().expect("tempdir");
        let target = tempfile::tempdir().expect("tempdir");
        KeyMaterial::generate()
            .write_to_dir(key_dir.path())
            .expect("write keys");
        let keys = KeyMaterial::load_from_dir(key_dir.path()).expect("load keys");

        let mapping = open(data.path(), &keys);
        mapping.set("a", 1);
        mapping.sync().expect("sync");

        let copied = mapping.backup(target.path(), false, None).expect("backup");
        assert_eq!(copied, target.path().join("cfg.db"));
        assert!(!target.path().join(SALT_FILE).exists());

        mapping.backup(target.path(), true, None).expect("backup with keys");
        assert!(target.path().join(SALT_FILE).exists());
        assert!(target.path().join(PEPPER_FILE).exists());

        let restored = open(target.path(), &KeyMaterial::load_from_dir(target.path()).expect("keys"));
        assert_eq!(restored.get("a"), Some(Value::Int(1)));

        let err = mapping
            .backup(&target.path().join("missing"), false, None)
            .expect_err("missing dir");
        assert!(matches!(err, MappingError::Configuration(_)));
    }

    #[test]
    fn backup_with_keys_needs_file_backed_material() {
        let data = tempfile::tempdir().expect("tempdir");
        let target = tempfile::tempdir().expect("tempdir");
        let mapping = open(data.path(), &KeyMaterial::generate());

        let err = mapping
            .backup(target.path(), true, None)
            .expect_err("ephemeral keys");
        assert!(matches!(err, MappingError::Configuration(_)));
    }

    #[test]
    fn shared_mapping_serializes_writers_across_threads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        let mapping = Arc::new(open(dir.path(), &keys));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let mapping = Arc::clone(&mapping);
                thread::spawn(move || {
                    for i in 0..10 {
                        mapping.set(format!("t{t}-{i}"), i);
                    }
                    mapping.sync().expect("sync");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        assert_eq!(mapping.len(), 40);
        assert_eq!(open(dir.path(), &keys).len(), 40);
    }

    #[test]
    fn held_lock_times_out_sync() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = KeyMaterial::generate();
        let mapping = EncryptedMapping::open(
            opts(dir.path()).lock_timeout(Duration::from_millis(30)),
            Some(keys),
        )
        .expect("open");

        let other = FileSnapshotStore::new(dir.path(), "cfg", "db", None).expect("store");
        let _held = other.lock().expect("lock");
        mapping.set("a", 1);
        let err = mapping.sync().expect_err("lock held elsewhere");
        assert!(matches!(err.root_cause(), MappingError::Timeout { .. }));
        assert_eq!(mapping.pending(), 1);
        drop(_held);
        mapping.sync().expect("sync after release");
    }

    /// Snapshot store whose writes fail a configurable number of times.
    struct FlakyStore {
        inner: InMemorySnapshotStore,
        failures: Arc<AtomicUsize>,
    }

    impl SnapshotStore for FlakyStore {
        type Guard<'a> = MutexGuard<'a, ()>;

        fn location(&self) -> String {
            "flaky".to_string()
        }

        fn lock(&self) -> Result<Self::Guard<'_>, StoreError> {
            self.inner.lock()
        }

        fn read(&self) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.read()
        }

        fn replace(&self, bytes: &[u8]) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::io(
                    "flaky",
                    std::io::Error::other("injected write failure"),
                ));
            }
            self.inner.replace(bytes)
        }

        fn remove(&self) -> Result<(), StoreError> {
            self.inner.remove()
        }
    }

    fn flaky() -> (EncryptedMapping<FlakyStore>, Arc<AtomicUsize>, InMemorySnapshotStore) {
        let failures = Arc::new(AtomicUsize::new(0));
        let inner = InMemorySnapshotStore::new();
        let store = FlakyStore {
            inner: inner.clone(),
            failures: Arc::clone(&failures),
        };
        let mapping =
            EncryptedMapping::with_store(store, true, Some(KeyMaterial::generate())).expect("open");
        (mapping, failures, inner)
    }

    #[test]
    fn single_failure_is_absorbed_by_retry() {
        let (mapping, failures, inner) = flaky();
        failures.store(1, Ordering::SeqCst);
        mapping.set("a", 1);
        mapping.sync().expect("retry should succeed");
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert_eq!(mapping.pending(), 0);
        assert!(inner.snapshot().is_some());
    }

    #[test]
    fn persistent_failure_surfaces_sync_error() {
        let (mapping, failures, _inner) = flaky();
        failures.store(2, Ordering::SeqCst);
        mapping.set("a", 1);

        let err = mapping.sync().expect_err("both attempts fail");
        assert!(matches!(err, MappingError::Sync { attempts: 2, .. }));
        assert!(err.is_io());
        assert_eq!(mapping.pending(), 1);
        assert_eq!(mapping.get("a"), Some(Value::Int(1)));

        mapping.sync().expect("recovers once writes succeed");
        assert_eq!(mapping.pending(), 0);
    }

    #[test]
    fn failed_close_does_not_flush_again_on_drop() {
        let (mapping, failures, _inner) = flaky();
        failures.store(5, Ordering::SeqCst);
        mapping.set("a", 1);

        let err = mapping.close().expect_err("writes keep failing");
        assert!(matches!(err, MappingError::Sync { attempts: 2, .. }));
        assert_eq!(failures.load(Ordering::SeqCst), 3);
    }
}
