//! Metadata Reader - Backend Replica Discovery
//!
//! For one logical key, lists the replica objects in the backend and
//! diffs them against the in-memory snapshot to produce newly updated
//! and newly deleted instance sets. Backend faults are swallowed here:
//! the reader returns an empty diff and reconciliation retries on the
//! next cycle.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use super::store::KvStore;
use crate::backend::ObjectMeta;

/// Diff between the backend listing and the in-memory replica snapshot.
#[derive(Debug, Default)]
pub struct InstanceUpdates {
    /// Replicas that are new or newer than the snapshot, by instance id
    pub updated: HashMap<String, ObjectMeta>,
    /// Instance ids gone from the backend. Contains the logical key
    /// itself when the key's tombstone was observed, which signals that
    /// the whole key is gone.
    pub deleted: HashSet<String>,
}

impl InstanceUpdates {
    /// True when nothing changed
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Discovers per-key replica changes in the backend.
pub struct MetadataReader {
    store: KvStore,
    deleted_flag: String,
}

impl MetadataReader {
    /// Create a reader; `deleted_flag` is the tombstone object name
    pub fn new(store: KvStore, deleted_flag: impl Into<String>) -> Self {
        Self {
            store,
            deleted_flag: deleted_flag.into(),
        }
    }

    /// Compute which replicas of `key` changed in the backend relative
    /// to `current`, the in-memory modification timestamps by instance.
    pub async fn fetch_instance_updates(
        &self,
        key: &str,
        current: &BTreeMap<String, i64>,
    ) -> InstanceUpdates {
        let entries = match self.store.list(&format!("{}/", key)).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(key, error = %e, "metadata listing failed; returning empty diff");
                return InstanceUpdates::default();
            }
        };

        let mut updates = InstanceUpdates::default();

        if entries.iter().any(|e| e.basename() == self.deleted_flag) {
            debug!(key, "tombstone observed");
            updates.deleted.insert(key.to_string());
            return updates;
        }

        let mut seen = HashSet::new();
        for entry in entries {
            let instance = entry.basename().to_string();
            seen.insert(instance.clone());
            match current.get(&instance) {
                Some(&ts) if ts >= entry.created_at => {}
                _ => {
                    updates.updated.insert(instance, entry);
                }
            }
        }

        for instance in current.keys() {
            if !seen.contains(instance) {
                updates.deleted.insert(instance.clone());
            }
        }

        if !updates.is_empty() {
            debug!(
                key,
                updated = updates.updated.len(),
                deleted = updates.deleted.len(),
                "replica set changed"
            );
        }
        updates
    }
}
