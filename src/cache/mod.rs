//! Replicated key-value cache over object storage.
//!
//! Four components composed bottom-up:
//!
//! - [`KvStore`] - encrypts/decrypts a single value and performs
//!   upload/download/delete/list against the storage backend
//! - [`MetadataReader`] - lists one key's replica objects and diffs them
//!   against the in-memory snapshot
//! - `ContentWriter` - batches pending per-key write intents, flushes
//!   them periodically, and garbage-collects stale redundant replicas
//! - [`CacheCoordinator`] - owns the bounded in-memory cache, per-key
//!   serialization, the reconciliation loop, and the public
//!   has/get/set/delete/subscribe contract
//!
//! # Backend layout
//!
//! ```text
//! <key>/<instance_id>     one replica's (optionally encrypted) JSON payload
//! <key>/<deleted_flag>    tombstone marker, payload null, written once
//! ```
//!
//! The layout is the only cross-instance protocol: processes never share
//! memory, they converge by polling the backend.

mod coordinator;
mod events;
mod keycache;
mod metadata;
mod store;
mod writer;

pub use coordinator::{CacheCoordinator, CacheStatsSnapshot};
pub use events::{CacheEvent, Subscription};
pub use metadata::{InstanceUpdates, MetadataReader};
pub use store::KvStore;
pub use writer::WriterStatsSnapshot;

/// Timestamp sentinel for the local replica; keeps a value that is
/// pending upload from ever being treated as stale by reconciliation.
pub(crate) const LOCAL_PENDING_TS: i64 = i64::MAX;

/// Backend path of one replica blob
pub(crate) fn replica_path(key: &str, instance_id: &str) -> String {
    format!("{}/{}", key, instance_id)
}

/// Backend path of a key's tombstone marker
pub(crate) fn tombstone_path(key: &str, deleted_flag: &str) -> String {
    format!("{}/{}", key, deleted_flag)
}
