//! Bounded LRU of Logical Keys
//!
//! In-memory view of the durable replica state: logical key to replicas
//! by instance id. Bounded by key count with least-recently-used
//! eviction. Memory here is only a view; the backend remains the source
//! of truth, so eviction never touches durable state.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::debug;

/// In-memory representation of one replica of a logical key.
#[derive(Debug, Clone)]
pub(crate) struct ReplicaRecord {
    /// Cached value; `None` when the replica is known to exist in the
    /// backend but its content has not been fetched yet
    pub value: Option<Value>,
    /// Backend modification time in epoch milliseconds; `i64::MAX` for
    /// the local replica (never treated as stale by reconciliation)
    pub modified_at: i64,
}

/// Replicas of one logical key, by instance id. `BTreeMap` gives the
/// stable iteration order `get` promises and the lexicographic tie-break
/// garbage collection relies on.
pub(crate) type ReplicaMap = BTreeMap<String, ReplicaRecord>;

struct KeySlot {
    replicas: ReplicaMap,
    last_access: u64,
}

/// Bounded LRU mapping logical keys to their replica records.
pub(crate) struct KeyCache {
    slots: HashMap<String, KeySlot>,
    max_keys: usize,
    clock: u64,
    evictions: u64,
}

impl KeyCache {
    pub fn new(max_keys: usize) -> Self {
        Self {
            slots: HashMap::new(),
            max_keys,
            clock: 0,
            evictions: 0,
        }
    }

    /// Access a key's replica map, creating an empty slot when absent.
    /// Touches the LRU clock; creating a slot over capacity evicts the
    /// least-recently-used key first.
    pub fn slot_mut(&mut self, key: &str) -> &mut ReplicaMap {
        if !self.slots.contains_key(key) {
            self.evict_to_fit();
        }
        self.clock += 1;
        let clock = self.clock;
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| KeySlot {
            replicas: BTreeMap::new(),
            last_access: clock,
        });
        slot.last_access = clock;
        &mut slot.replicas
    }

    /// Replica map with an LRU touch; `None` when the key is absent
    pub fn touch_mut(&mut self, key: &str) -> Option<&mut ReplicaMap> {
        self.clock += 1;
        let clock = self.clock;
        self.slots.get_mut(key).map(|slot| {
            slot.last_access = clock;
            &mut slot.replicas
        })
    }

    /// Replica map without touching the LRU clock
    pub fn peek(&self, key: &str) -> Option<&ReplicaMap> {
        self.slots.get(key).map(|slot| &slot.replicas)
    }

    /// Mutable replica map without touching the LRU clock
    pub fn peek_mut(&mut self, key: &str) -> Option<&mut ReplicaMap> {
        self.slots.get_mut(key).map(|slot| &mut slot.replicas)
    }

    /// True when the key holds at least one replica record
    pub fn has_replicas(&self, key: &str) -> bool {
        self.peek(key).map_or(false, |replicas| !replicas.is_empty())
    }

    /// Remove a key entirely. Returns true when it was resident.
    pub fn remove(&mut self, key: &str) -> bool {
        self.slots.remove(key).is_some()
    }

    /// Snapshot of all resident keys
    pub fn keys(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    fn evict_to_fit(&mut self) {
        // Eviction can drop a local value whose upload intent has not
        // flushed yet; the durable copy then lags until the next local
        // write. The backend, not memory, is the source of truth.
        while self.slots.len() >= self.max_keys {
            let lru = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(key, _)| key.clone());
            match lru {
                Some(key) => {
                    self.slots.remove(&key);
                    self.evictions += 1;
                    debug!(key = %key, "evicted least-recently-used key");
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: i64) -> ReplicaRecord {
        ReplicaRecord {
            value: Some(json!(value)),
            modified_at: value,
        }
    }

    #[test]
    fn test_slot_mut_creates_and_returns() {
        let mut cache = KeyCache::new(4);
        cache.slot_mut("k").insert("a".to_string(), record(1));

        assert!(cache.has_replicas("k"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_empty_slot_has_no_replicas() {
        let mut cache = KeyCache::new(4);
        cache.slot_mut("k");

        assert!(!cache.has_replicas("k"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut cache = KeyCache::new(2);
        cache.slot_mut("a");
        cache.slot_mut("b");
        cache.slot_mut("c");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let mut cache = KeyCache::new(2);
        cache.slot_mut("a");
        cache.slot_mut("b");

        // Touch "a" so "b" becomes the eviction candidate.
        cache.touch_mut("a");
        cache.slot_mut("c");

        assert!(cache.peek("a").is_some());
        assert!(cache.peek("b").is_none());
        assert!(cache.peek("c").is_some());
    }

    #[test]
    fn test_peek_does_not_touch() {
        let mut cache = KeyCache::new(2);
        cache.slot_mut("a");
        cache.slot_mut("b");

        // Peeking "a" must not refresh its recency.
        cache.peek("a");
        cache.slot_mut("c");

        assert!(cache.peek("a").is_none());
        assert!(cache.peek("b").is_some());
    }

    #[test]
    fn test_remove() {
        let mut cache = KeyCache::new(4);
        cache.slot_mut("k").insert("a".to_string(), record(1));

        assert!(cache.remove("k"));
        assert!(!cache.remove("k"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_replica_order_is_stable() {
        let mut cache = KeyCache::new(4);
        let replicas = cache.slot_mut("k");
        replicas.insert("c".to_string(), record(3));
        replicas.insert("a".to_string(), record(1));
        replicas.insert("b".to_string(), record(2));

        let order: Vec<&String> = cache.peek("k").unwrap().keys().collect();
        assert_eq!(order, ["a", "b", "c"]);
    }
}
