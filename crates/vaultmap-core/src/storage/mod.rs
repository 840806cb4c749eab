//! Persistence contract for full mapping snapshots.

mod snapshot_store;

pub use snapshot_store::{InMemorySnapshotStore, SnapshotStore, StoreError};
