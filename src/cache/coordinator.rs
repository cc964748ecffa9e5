//! Cache Coordinator - Public Cache Surface
//!
//! Owns the bounded in-memory key cache, per-key serialization, the
//! periodic reconciliation loop, and the has/get/set/delete/subscribe
//! contract. Callers talk only to the coordinator; cross-instance
//! coordination happens through the durable backend alone, never through
//! shared memory.
//!
//! # Ordering guarantees
//!
//! Within one key, operations execute in submission order: `has`, `get`,
//! and reconciliation for the same key serialize on that key's lock.
//! Across keys there is no ordering. A local `set` followed by a local
//! `get` always observes the just-written value; durability arrives with
//! the next flush cycle, and foreign visibility within one write plus
//! one read interval.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::events::{CacheEvent, EventBus, Subscription};
use super::keycache::{KeyCache, ReplicaRecord};
use super::metadata::MetadataReader;
use super::store::KvStore;
use super::writer::{ContentWriter, WriteKind, WriterStatsSnapshot};
use super::{replica_path, LOCAL_PENDING_TS};
use crate::backend::ObjectStore;
use crate::cipher::{Aes256GcmCipher, ContentCipher, SecretKey};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct CoordinatorStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sync_checks: AtomicU64,
    reconcile_cycles: AtomicU64,
    events_published: AtomicU64,
}

/// Point-in-time operational counters
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Lookups answered from memory
    pub hits: u64,
    /// Lookups for keys unknown to this instance
    pub misses: u64,
    /// Synchronous single-key reconciliations triggered by `has`
    pub sync_checks: u64,
    /// Background reconciliation cycles that checked at least one key
    pub reconcile_cycles: u64,
    /// Events delivered to subscribers
    pub events_published: u64,
    /// Logical keys currently in memory
    pub cached_keys: usize,
    /// Keys dropped by LRU eviction
    pub evictions: u64,
    /// Keys with an outstanding write intent
    pub pending_writes: usize,
    /// Content writer counters
    pub writer: WriterStatsSnapshot,
}

/// State shared between the coordinator and the content writer.
pub(crate) struct CacheShared {
    pub(crate) config: CacheConfig,
    pub(crate) store: KvStore,
    pub(crate) cache: Mutex<KeyCache>,
    reader: MetadataReader,
    secrets: Mutex<HashMap<String, SecretKey>>,
    deleted: Mutex<HashSet<String>>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    updating: Mutex<HashSet<String>>,
    events: Arc<EventBus>,
    stats: CoordinatorStats,
}

impl CacheShared {
    pub(crate) fn new(
        config: CacheConfig,
        backend: Arc<dyn ObjectStore>,
        cipher: Arc<dyn ContentCipher>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let store = KvStore::new(backend, cipher);
        let reader = MetadataReader::new(store.clone(), config.deleted_flag.clone());
        Ok(Arc::new(Self {
            cache: Mutex::new(KeyCache::new(config.max_keys)),
            secrets: Mutex::new(HashMap::new()),
            deleted: Mutex::new(HashSet::new()),
            key_locks: Mutex::new(HashMap::new()),
            updating: Mutex::new(HashSet::new()),
            events: Arc::new(EventBus::default()),
            stats: CoordinatorStats::default(),
            store,
            reader,
            config,
        }))
    }

    /// The key's private lock, created lazily
    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn is_deleted(&self, key: &str) -> bool {
        self.deleted.lock().contains(key)
    }

    /// Register the key's secret on first use
    fn register_secret(&self, key: &str, secret: &SecretKey) {
        self.secrets
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| secret.clone());
    }

    /// Snapshot of per-instance modification timestamps for `key`
    fn timestamps(&self, key: &str) -> BTreeMap<String, i64> {
        self.cache
            .lock()
            .peek(key)
            .map(|replicas| {
                replicas
                    .iter()
                    .map(|(instance, record)| (instance.clone(), record.modified_at))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop the key from every local structure and queue the backend
    /// delete. A key without registered key material cannot authorize
    /// its deletion payload, so the tombstone is skipped and logged.
    fn delete_local(&self, key: &str, writer: &ContentWriter) {
        self.cache.lock().remove(key);
        self.deleted.lock().insert(key.to_string());
        self.key_locks.lock().remove(key);
        match self.secrets.lock().remove(key) {
            Some(secret) => writer.record(key, WriteKind::Delete, secret),
            None => {
                error!(key, "no symmetric key registered; tombstone will not be written");
            }
        }
    }

    /// Reconcile one key against the backend. Callers must hold the
    /// key's lock; overlapping requests for the same key coalesce into
    /// one run.
    pub(crate) async fn check_updates(&self, writer: &ContentWriter, key: &str) {
        if self.is_deleted(key) {
            return;
        }
        if !self.updating.lock().insert(key.to_string()) {
            return;
        }
        self.run_check(writer, key).await;
        self.updating.lock().remove(key);
    }

    async fn run_check(&self, writer: &ContentWriter, key: &str) {
        let current = self.timestamps(key);
        let updates = self.reader.fetch_instance_updates(key, &current).await;

        if updates.deleted.contains(key) {
            info!(key, "tombstone observed; dropping key");
            self.delete_local(key, writer);
            self.publish(CacheEvent::KeyDeleted {
                key: key.to_string(),
            });
            return;
        }

        let had_replicas = !current.is_empty();
        let gained_replicas = !updates.updated.is_empty();
        let dropped = {
            let mut cache = self.cache.lock();
            if gained_replicas {
                let replicas = cache.slot_mut(key);
                for (instance, meta) in &updates.updated {
                    replicas.insert(
                        instance.clone(),
                        ReplicaRecord {
                            value: None,
                            modified_at: meta.created_at,
                        },
                    );
                }
            }
            let mut now_empty = false;
            if let Some(replicas) = cache.peek_mut(key) {
                for instance in &updates.deleted {
                    // The local entry is never dropped on behalf of the
                    // backend while the process is alive.
                    if *instance != self.config.instance_id {
                        replicas.remove(instance);
                    }
                }
                now_empty = replicas.is_empty();
            }
            if now_empty {
                cache.remove(key);
            }
            now_empty
        };
        if dropped {
            // The key left memory; its private lock goes with it.
            self.key_locks.lock().remove(key);
        }

        if gained_replicas && had_replicas {
            self.publish(CacheEvent::InstancesChanged {
                key: key.to_string(),
            });
        }
    }

    fn publish(&self, event: CacheEvent) {
        let delivered = self.events.publish(&event);
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        debug!(?event, delivered, "published cache event");
    }
}

/// Owned timers for the reconciliation and flush loops.
#[derive(Default)]
struct Scheduler {
    token: Option<CancellationToken>,
    loops: Vec<JoinHandle<()>>,
}

/// Entry point of the replicated cache layer.
///
/// Multiple coordinator instances (typically in different processes)
/// share a logical key space through one storage backend; each holds and
/// writes only its own replica of a value and discovers the others by
/// periodic reconciliation.
pub struct CacheCoordinator {
    shared: Arc<CacheShared>,
    writer: Arc<ContentWriter>,
    read_semaphore: Arc<Semaphore>,
    scheduler: Mutex<Scheduler>,
}

impl CacheCoordinator {
    /// Create a coordinator over `backend` with the default AES-256-GCM
    /// content cipher
    pub fn new(config: CacheConfig, backend: Arc<dyn ObjectStore>) -> Result<Self> {
        Self::with_cipher(config, backend, Arc::new(Aes256GcmCipher))
    }

    /// Create a coordinator with a custom content cipher
    pub fn with_cipher(
        config: CacheConfig,
        backend: Arc<dyn ObjectStore>,
        cipher: Arc<dyn ContentCipher>,
    ) -> Result<Self> {
        let read_permits = config.read_metadata_concurrency;
        let shared = CacheShared::new(config, backend, cipher)?;
        let writer = Arc::new(ContentWriter::new(Arc::clone(&shared)));
        Ok(Self {
            shared,
            writer,
            read_semaphore: Arc::new(Semaphore::new(read_permits)),
            scheduler: Mutex::new(Scheduler::default()),
        })
    }

    /// This process's instance id
    pub fn instance_id(&self) -> &str {
        &self.shared.config.instance_id
    }

    /// True when the key has at least one replica in memory. A key that
    /// is not memory-resident triggers one synchronous reconciliation
    /// pass for that key alone before answering.
    #[instrument(skip(self))]
    pub async fn has(&self, key: &str) -> bool {
        if self.shared.is_deleted(key) {
            return false;
        }
        if self.shared.cache.lock().has_replicas(key) {
            self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        self.shared.stats.sync_checks.fetch_add(1, Ordering::Relaxed);
        let lock = self.shared.key_lock(key);
        let _guard = lock.lock().await;
        self.shared.check_updates(&self.writer, key).await;
        self.shared.cache.lock().has_replicas(key)
    }

    /// All known values of `key`: the local instance's value first (or
    /// `None` when this instance holds no replica), then every other
    /// replica's value in instance-id order. Foreign content that has
    /// not been fetched yet is pulled from the backend synchronously and
    /// those failures surface to the caller. Returns `None` when the key
    /// is deleted or unknown; an unknown key starts being tracked so the
    /// next reconciliation cycle can discover it.
    #[instrument(skip(self, secret))]
    pub async fn get(&self, key: &str, secret: &SecretKey) -> Result<Option<Vec<Option<Value>>>> {
        if self.shared.is_deleted(key) {
            return Ok(None);
        }
        self.shared.register_secret(key, secret);

        let lock = self.shared.key_lock(key);
        let _guard = lock.lock().await;

        let known: Option<Vec<(String, bool)>> = {
            let mut cache = self.shared.cache.lock();
            let snapshot = match cache.touch_mut(key) {
                Some(replicas) if !replicas.is_empty() => Some(
                    replicas
                        .iter()
                        .map(|(instance, record)| (instance.clone(), record.value.is_some()))
                        .collect(),
                ),
                _ => None,
            };
            if snapshot.is_none() {
                cache.slot_mut(key);
            }
            snapshot
        };
        let known = match known {
            Some(known) => known,
            None => {
                self.shared.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key, "key unknown; tracking for reconciliation");
                return Ok(None);
            }
        };
        self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);

        // Pull content for replicas known only by metadata.
        for (instance, has_value) in &known {
            if *has_value || *instance == self.shared.config.instance_id {
                continue;
            }
            let path = replica_path(key, instance);
            if let Some(value) = self.shared.store.get(&path, Some(secret)).await? {
                let mut cache = self.shared.cache.lock();
                if let Some(replicas) = cache.peek_mut(key) {
                    if let Some(record) = replicas.get_mut(instance) {
                        record.value = Some(value);
                    }
                }
            }
        }

        let cache = self.shared.cache.lock();
        let replicas = match cache.peek(key) {
            Some(replicas) => replicas,
            None => return Ok(None),
        };
        let mut values = Vec::with_capacity(replicas.len() + 1);
        values.push(
            replicas
                .get(&self.shared.config.instance_id)
                .and_then(|record| record.value.clone()),
        );
        for (instance, record) in replicas.iter() {
            if *instance != self.shared.config.instance_id {
                values.push(record.value.clone());
            }
        }
        Ok(Some(values))
    }

    /// Record the local replica and queue an upload. The write is
    /// visible to subsequent local `get`/`has` immediately and becomes
    /// durable with the next flush cycle.
    #[instrument(skip(self, value, secret))]
    pub fn set(&self, key: &str, value: Value, secret: &SecretKey) -> Result<()> {
        if self.shared.is_deleted(key) {
            return Err(Error::ObjectDeleted(key.to_string()));
        }
        self.shared.register_secret(key, secret);
        {
            let mut cache = self.shared.cache.lock();
            cache.slot_mut(key).insert(
                self.shared.config.instance_id.clone(),
                ReplicaRecord {
                    value: Some(value),
                    modified_at: LOCAL_PENDING_TS,
                },
            );
        }
        self.writer.record(key, WriteKind::Upload, secret.clone());
        debug!(key, "local replica updated");
        Ok(())
    }

    /// Drop the key locally and queue the backend delete. Pending work
    /// for the key is superseded. Missing key material is logged, never
    /// raised.
    #[instrument(skip(self))]
    pub fn delete(&self, key: &str) {
        self.shared.delete_local(key, &self.writer);
        debug!(key, "key deleted locally");
    }

    /// Register for change notifications. The returned handle
    /// deregisters the callback when dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        Arc::clone(&self.shared.events).subscribe(Arc::new(callback))
    }

    /// Start the reconciliation and flush loops. Loops whose interval is
    /// zero stay disabled.
    pub fn run(&self) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.token.is_some() {
            warn!("coordinator loops already running");
            return;
        }
        let token = CancellationToken::new();

        if !self.shared.config.read_interval.is_zero() {
            let shared = Arc::clone(&self.shared);
            let writer = Arc::clone(&self.writer);
            let semaphore = Arc::clone(&self.read_semaphore);
            let child = token.clone();
            scheduler.loops.push(tokio::spawn(async move {
                reconcile_loop(shared, writer, semaphore, child).await;
            }));
        }
        if !self.shared.config.write_interval.is_zero() {
            let writer = Arc::clone(&self.writer);
            scheduler.loops.push(tokio::spawn(writer.run(token.clone())));
        }

        scheduler.token = Some(token);
        info!(instance = %self.shared.config.instance_id, "cache coordinator started");
    }

    /// Cancel the periodic loops. In-flight tasks are not aborted; they
    /// drain during [`shutdown`](Self::shutdown).
    pub fn stop(&self) {
        if let Some(token) = self.scheduler.lock().token.take() {
            token.cancel();
        }
    }

    /// Stop the loops, wait for them to finish, then flush pending
    /// writes until drained. The coordinator remains usable afterwards
    /// and can be started again with [`run`](Self::run).
    pub async fn shutdown(&self) {
        self.stop();
        let loops = std::mem::take(&mut self.scheduler.lock().loops);
        for handle in loops {
            let _ = handle.await;
        }
        Arc::clone(&self.writer).drain().await;
        info!("cache coordinator shut down");
    }

    /// Point-in-time operational counters
    pub fn stats(&self) -> CacheStatsSnapshot {
        let (cached_keys, evictions) = {
            let cache = self.shared.cache.lock();
            (cache.len(), cache.evictions())
        };
        CacheStatsSnapshot {
            hits: self.shared.stats.hits.load(Ordering::Relaxed),
            misses: self.shared.stats.misses.load(Ordering::Relaxed),
            sync_checks: self.shared.stats.sync_checks.load(Ordering::Relaxed),
            reconcile_cycles: self.shared.stats.reconcile_cycles.load(Ordering::Relaxed),
            events_published: self.shared.stats.events_published.load(Ordering::Relaxed),
            cached_keys,
            evictions,
            pending_writes: self.writer.pending_count(),
            writer: self.writer.stats_snapshot(),
        }
    }
}

/// Periodic reconciliation; returns when `shutdown` fires.
async fn reconcile_loop(
    shared: Arc<CacheShared>,
    writer: Arc<ContentWriter>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    let interval = shared.config.read_interval;
    info!(interval_ms = interval.as_millis() as u64, "reconciliation loop started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                reconcile_pass(&shared, &writer, &semaphore).await;
            }
        }
    }
    info!("reconciliation loop stopped");
}

/// One reconciliation cycle over every memory-resident key. The next
/// cycle is only scheduled after every check of this one finished.
async fn reconcile_pass(
    shared: &Arc<CacheShared>,
    writer: &Arc<ContentWriter>,
    semaphore: &Arc<Semaphore>,
) {
    let keys = shared.cache.lock().keys();
    if keys.is_empty() {
        return;
    }
    shared.stats.reconcile_cycles.fetch_add(1, Ordering::Relaxed);
    debug!(keys = keys.len(), "reconciliation cycle started");

    let checks = keys.into_iter().map(|key| {
        let shared = Arc::clone(shared);
        let writer = Arc::clone(writer);
        let semaphore = Arc::clone(semaphore);
        async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let lock = shared.key_lock(&key);
            let _guard = lock.lock().await;
            shared.check_updates(&writer, &key).await;
        }
    });
    join_all(checks).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;

    fn make_coordinator(instance_id: &str) -> (Arc<InMemoryBackend>, CacheCoordinator) {
        let backend = Arc::new(InMemoryBackend::new());
        let config = CacheConfig {
            instance_id: instance_id.to_string(),
            write_interval: Duration::ZERO,
            read_interval: Duration::ZERO,
            ..CacheConfig::default()
        };
        let coordinator = CacheCoordinator::new(config, backend.clone()).unwrap();
        (backend, coordinator)
    }

    #[tokio::test]
    async fn test_set_is_immediately_visible_locally() {
        let (_backend, coordinator) = make_coordinator("a");
        let secret = SecretKey::derive("pw");

        coordinator.set("k", json!({ "n": 1 }), &secret).unwrap();

        assert!(coordinator.has("k").await);
        let values = coordinator.get("k", &secret).await.unwrap().unwrap();
        assert_eq!(values, vec![Some(json!({ "n": 1 }))]);
    }

    #[tokio::test]
    async fn test_get_unknown_key_is_none_and_tracked() {
        let (_backend, coordinator) = make_coordinator("a");
        let secret = SecretKey::derive("pw");

        assert_eq!(coordinator.get("k", &secret).await.unwrap(), None);
        // The key is now tracked for reconciliation, but holds nothing.
        assert_eq!(coordinator.stats().cached_keys, 1);
        assert!(!coordinator.shared.cache.lock().has_replicas("k"));
    }

    #[tokio::test]
    async fn test_set_after_delete_is_rejected() {
        let (_backend, coordinator) = make_coordinator("a");
        let secret = SecretKey::derive("pw");

        coordinator.set("k", json!(1), &secret).unwrap();
        coordinator.delete("k");

        assert_matches!(
            coordinator.set("k", json!(2), &secret),
            Err(Error::ObjectDeleted(_))
        );
        assert!(!coordinator.has("k").await);
        assert_eq!(coordinator.get("k", &secret).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_supersedes_pending_upload() {
        let (backend, coordinator) = make_coordinator("a");
        let secret = SecretKey::derive("pw");

        coordinator.set("k", json!(1), &secret).unwrap();
        coordinator.delete("k");
        assert_eq!(coordinator.stats().pending_writes, 1);

        coordinator.shutdown().await;

        // Only the tombstone made it to the backend.
        assert_eq!(backend.paths(), ["k/deleted"]);
    }

    #[tokio::test]
    async fn test_delete_without_secret_writes_nothing() {
        let (backend, coordinator) = make_coordinator("a");

        coordinator.delete("unseen");
        coordinator.shutdown().await;

        assert_eq!(backend.object_count(), 0);
        assert!(!coordinator.has("unseen").await);
    }

    #[tokio::test]
    async fn test_has_discovers_foreign_replica_synchronously() {
        let (backend, coordinator) = make_coordinator("b");
        let secret = SecretKey::derive("pw");

        // Another instance's replica, written out of band.
        let store = KvStore::new(backend.clone() as Arc<dyn ObjectStore>, Arc::new(Aes256GcmCipher));
        store.set("k/a", &json!({ "n": 1 }), Some(&secret)).await.unwrap();

        assert!(coordinator.has("k").await);
        let values = coordinator.get("k", &secret).await.unwrap().unwrap();
        assert_eq!(values, vec![None, Some(json!({ "n": 1 }))]);
    }

    #[tokio::test]
    async fn test_has_lists_at_most_once_for_known_key() {
        let (backend, coordinator) = make_coordinator("b");
        let secret = SecretKey::derive("pw");

        let store = KvStore::new(backend.clone() as Arc<dyn ObjectStore>, Arc::new(Aes256GcmCipher));
        store.set("k/a", &json!(1), Some(&secret)).await.unwrap();

        assert!(coordinator.has("k").await);
        let lists_after_first = backend.stats().lists;
        assert!(coordinator.has("k").await);

        assert_eq!(backend.stats().lists, lists_after_first);
        assert_eq!(lists_after_first, 1);
    }

    #[tokio::test]
    async fn test_has_missing_key_is_false() {
        let (_backend, coordinator) = make_coordinator("a");
        assert!(!coordinator.has("ghost").await);
        assert_eq!(coordinator.stats().cached_keys, 0);
    }

    #[tokio::test]
    async fn test_get_propagates_backend_fault_on_content_fetch() {
        let (backend, coordinator) = make_coordinator("b");
        let secret = SecretKey::derive("pw");

        let store = KvStore::new(backend.clone() as Arc<dyn ObjectStore>, Arc::new(Aes256GcmCipher));
        store.set("k/a", &json!(1), Some(&secret)).await.unwrap();
        assert!(coordinator.has("k").await);

        backend.set_fail_ops(true);
        assert_matches!(
            coordinator.get("k", &secret).await,
            Err(Error::Backend(_))
        );
    }

    #[tokio::test]
    async fn test_tombstone_observation_publishes_once() {
        let (backend, coordinator) = make_coordinator("b");
        let secret = SecretKey::derive("pw");

        let store = KvStore::new(backend.clone() as Arc<dyn ObjectStore>, Arc::new(Aes256GcmCipher));
        store.set("k/a", &json!(1), Some(&secret)).await.unwrap();
        assert!(coordinator.has("k").await);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _subscription = coordinator.subscribe(move |event: &CacheEvent| {
            sink.lock().push(event.clone());
        });

        // The owner deletes the key out of band.
        store.delete("k/a").await.unwrap();
        store.set("k/deleted", &Value::Null, None).await.unwrap();

        // Two reconciliation passes: only the first may publish.
        for _ in 0..2 {
            let lock = coordinator.shared.key_lock("k");
            let _guard = lock.lock().await;
            coordinator
                .shared
                .check_updates(&coordinator.writer, "k")
                .await;
        }

        assert!(!coordinator.has("k").await);
        let seen = events.lock().clone();
        assert_eq!(
            seen,
            vec![CacheEvent::KeyDeleted {
                key: "k".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_vanished_foreign_replica_is_dropped() {
        let (backend, coordinator) = make_coordinator("b");
        let secret = SecretKey::derive("pw");

        let store = KvStore::new(backend.clone() as Arc<dyn ObjectStore>, Arc::new(Aes256GcmCipher));
        store.set("k/a", &json!(1), Some(&secret)).await.unwrap();
        assert!(coordinator.has("k").await);

        store.delete("k/a").await.unwrap();

        {
            let lock = coordinator.shared.key_lock("k");
            let _guard = lock.lock().await;
            coordinator
                .shared
                .check_updates(&coordinator.writer, "k")
                .await;
        }

        // The key lost its only replica and was dropped entirely.
        assert_eq!(coordinator.stats().cached_keys, 0);
        assert!(!coordinator.has("k").await);
    }

    #[tokio::test]
    async fn test_local_replica_survives_backend_absence() {
        let (_backend, coordinator) = make_coordinator("a");
        let secret = SecretKey::derive("pw");

        // Local write not yet flushed: the backend knows nothing.
        coordinator.set("k", json!(1), &secret).unwrap();

        let lock = coordinator.shared.key_lock("k");
        {
            let _guard = lock.lock().await;
            coordinator
                .shared
                .check_updates(&coordinator.writer, "k")
                .await;
        }

        // Reconciliation must not drop the local pending record.
        let values = coordinator.get("k", &secret).await.unwrap().unwrap();
        assert_eq!(values, vec![Some(json!(1))]);
    }

    #[tokio::test]
    async fn test_run_and_shutdown_lifecycle() {
        let backend = Arc::new(InMemoryBackend::new());
        let config = CacheConfig {
            instance_id: "a".to_string(),
            write_interval: Duration::from_millis(10),
            read_interval: Duration::from_millis(10),
            ..CacheConfig::default()
        };
        let coordinator = CacheCoordinator::new(config, backend.clone()).unwrap();
        let secret = SecretKey::derive("pw");

        coordinator.run();
        coordinator.run(); // second call is a no-op

        coordinator.set("k", json!(1), &secret).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.paths(), ["k/a"]);

        coordinator.shutdown().await;
        assert_eq!(coordinator.stats().pending_writes, 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_writes() {
        let (backend, coordinator) = make_coordinator("a");
        let secret = SecretKey::derive("pw");

        coordinator.set("k", json!({ "n": 1 }), &secret).unwrap();
        assert_eq!(backend.object_count(), 0);

        coordinator.shutdown().await;
        assert_eq!(backend.paths(), ["k/a"]);
    }

    #[tokio::test]
    async fn test_eviction_under_pressure_keeps_backend_intact() {
        let backend = Arc::new(InMemoryBackend::new());
        let config = CacheConfig {
            instance_id: "a".to_string(),
            max_keys: 2,
            write_interval: Duration::ZERO,
            read_interval: Duration::ZERO,
            ..CacheConfig::default()
        };
        let coordinator = CacheCoordinator::new(config, backend.clone()).unwrap();
        let secret = SecretKey::derive("pw");

        for key in ["k1", "k2", "k3"] {
            coordinator.set(key, json!(key), &secret).unwrap();
        }
        assert_eq!(coordinator.stats().cached_keys, 2);
        assert_eq!(coordinator.stats().evictions, 1);

        // The evicted key's intent is skipped, the resident ones flush.
        coordinator.shutdown().await;
        assert_eq!(backend.paths(), ["k2/a", "k3/a"]);
        assert_eq!(coordinator.stats().writer.skipped_missing_local, 1);
    }
}
