//! Content Writer - Batched Flush of Pending Writes
//!
//! Collects per-key write intents (upload or delete) and pushes them to
//! the backend in bounded-concurrency flush cycles. Only the most recent
//! intent per key survives; a completed flush clears an intent only when
//! no newer one arrived while it was in flight. After each successful
//! upload the writer garbage-collects stale redundant replicas of the
//! key, always leaving at least one durable backup beyond the local
//! copy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::coordinator::CacheShared;
use super::keycache::ReplicaMap;
use super::{replica_path, tombstone_path};
use crate::cipher::SecretKey;

/// What the next flush must do for one logical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    /// Upload the local replica's current value
    Upload,
    /// Remove every replica and write the tombstone
    Delete,
}

#[derive(Clone)]
struct PendingWrite {
    kind: WriteKind,
    index: u64,
    secret: SecretKey,
}

#[derive(Debug, Default)]
struct WriterStats {
    flush_cycles: AtomicU64,
    uploads: AtomicU64,
    tombstones: AtomicU64,
    skipped_missing_local: AtomicU64,
    gc_removed: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time flush counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct WriterStatsSnapshot {
    /// Flush cycles that dispatched at least one task
    pub flush_cycles: u64,
    /// Successful replica uploads
    pub uploads: u64,
    /// Tombstones written
    pub tombstones: u64,
    /// Upload intents skipped because the local value was gone
    pub skipped_missing_local: u64,
    /// Replicas removed by garbage collection
    pub gc_removed: u64,
    /// Flush tasks that failed and left their intent for a later cycle
    pub failures: u64,
}

/// Batches and flushes pending per-key write intents.
pub(crate) struct ContentWriter {
    shared: Arc<CacheShared>,
    pending: Mutex<HashMap<String, PendingWrite>>,
    next_index: AtomicU64,
    semaphore: Arc<Semaphore>,
    stats: WriterStats,
}

impl ContentWriter {
    pub fn new(shared: Arc<CacheShared>) -> Self {
        let permits = shared.config.write_content_concurrency;
        Self {
            shared,
            pending: Mutex::new(HashMap::new()),
            next_index: AtomicU64::new(0),
            semaphore: Arc::new(Semaphore::new(permits)),
            stats: WriterStats::default(),
        }
    }

    /// Record (or supersede) the pending intent for `key`
    pub fn record(&self, key: &str, kind: WriteKind, secret: SecretKey) {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().insert(
            key.to_string(),
            PendingWrite {
                kind,
                index,
                secret,
            },
        );
        debug!(key, ?kind, index, "recorded write intent");
    }

    /// Number of keys with an outstanding intent
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats_snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            flush_cycles: self.stats.flush_cycles.load(Ordering::Relaxed),
            uploads: self.stats.uploads.load(Ordering::Relaxed),
            tombstones: self.stats.tombstones.load(Ordering::Relaxed),
            skipped_missing_local: self.stats.skipped_missing_local.load(Ordering::Relaxed),
            gc_removed: self.stats.gc_removed.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }

    /// Run one flush cycle: dispatch every pending intent with bounded
    /// concurrency and wait for all dispatched tasks to finish.
    #[instrument(skip(self))]
    pub async fn flush(self: Arc<Self>) {
        let snapshot: Vec<(String, PendingWrite)> = self
            .pending
            .lock()
            .iter()
            .map(|(key, intent)| (key.clone(), intent.clone()))
            .collect();
        if snapshot.is_empty() {
            return;
        }
        self.stats.flush_cycles.fetch_add(1, Ordering::Relaxed);
        debug!(intents = snapshot.len(), "flush cycle started");

        let mut tasks = JoinSet::new();
        for (key, intent) in snapshot {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let writer = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                let settled = match intent.kind {
                    WriteKind::Upload => writer.flush_upload(&key, &intent.secret).await,
                    WriteKind::Delete => writer.flush_delete(&key).await,
                };
                if settled {
                    writer.clear_intent(&key, intent.index);
                } else {
                    writer.stats.failures.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        debug!("flush cycle finished");
    }

    /// Clear the intent only when no newer set arrived while the flush
    /// task was in flight. The check and the removal happen under one
    /// lock acquisition, so a superseding intent can never be lost.
    fn clear_intent(&self, key: &str, index: u64) {
        let mut pending = self.pending.lock();
        if matches!(pending.get(key), Some(intent) if intent.index == index) {
            pending.remove(key);
        }
    }

    /// Upload the local replica's current value. Returns true when the
    /// intent is settled, including the skipped missing-local case.
    async fn flush_upload(&self, key: &str, secret: &SecretKey) -> bool {
        let value: Option<Value> = {
            let cache = self.shared.cache.lock();
            cache
                .peek(key)
                .and_then(|replicas| replicas.get(&self.shared.config.instance_id))
                .and_then(|record| record.value.clone())
        };
        let value = match value {
            Some(value) => value,
            None => {
                // The intent outlived the in-memory record (a delete or
                // an eviction raced the flush). Operator-visible, not
                // retryable.
                error!(key, "local replica missing at flush time; skipping upload");
                self.stats
                    .skipped_missing_local
                    .fetch_add(1, Ordering::Relaxed);
                return true;
            }
        };

        let path = replica_path(key, &self.shared.config.instance_id);
        match self.shared.store.set(&path, &value, Some(secret)).await {
            Ok(()) => {
                self.stats.uploads.fetch_add(1, Ordering::Relaxed);
                self.collect_garbage(key).await;
                true
            }
            Err(e) => {
                warn!(key, error = %e, "upload failed; will retry next cycle");
                false
            }
        }
    }

    /// Delete every replica blob of `key`, then write the tombstone when
    /// it was not already present.
    async fn flush_delete(&self, key: &str) -> bool {
        let entries = match self.shared.store.list(&format!("{}/", key)).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(key, error = %e, "delete listing failed; will retry next cycle");
                return false;
            }
        };

        let deleted_flag = &self.shared.config.deleted_flag;
        let had_tombstone = entries.iter().any(|e| e.basename() == *deleted_flag);

        for entry in entries.iter().filter(|e| e.basename() != *deleted_flag) {
            if let Err(e) = self.shared.store.delete(&entry.path).await {
                warn!(key, path = %entry.path, error = %e, "replica delete failed; will retry next cycle");
                return false;
            }
        }

        if !had_tombstone {
            let path = tombstone_path(key, deleted_flag);
            if let Err(e) = self.shared.store.set(&path, &Value::Null, None).await {
                warn!(key, error = %e, "tombstone write failed; will retry next cycle");
                return false;
            }
            self.stats.tombstones.fetch_add(1, Ordering::Relaxed);
        }

        info!(key, "key deleted from backend");
        true
    }

    /// Remove stale redundant foreign replicas after a successful upload.
    async fn collect_garbage(&self, key: &str) {
        let cutoff =
            Utc::now().timestamp_millis() - self.shared.config.cache_expiration.as_millis() as i64;

        let candidates = {
            let cache = self.shared.cache.lock();
            match cache.peek(key) {
                Some(replicas) => {
                    stale_replicas(replicas, &self.shared.config.instance_id, cutoff)
                }
                None => return,
            }
        };

        for instance in select_garbage(candidates) {
            let path = replica_path(key, &instance);
            match self.shared.store.delete(&path).await {
                Ok(()) => {
                    let mut cache = self.shared.cache.lock();
                    if let Some(replicas) = cache.peek_mut(key) {
                        replicas.remove(&instance);
                    }
                    self.stats.gc_removed.fetch_add(1, Ordering::Relaxed);
                    debug!(key, instance = %instance, "garbage-collected stale replica");
                }
                Err(e) => {
                    // Entry stays in memory so a later cycle retries.
                    warn!(key, instance = %instance, error = %e, "replica gc delete failed");
                }
            }
        }
    }

    /// Periodic flush loop; returns when `shutdown` fires. Each cycle is
    /// awaited in full before the next one is scheduled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.shared.config.write_interval;
        if interval.is_zero() {
            return;
        }
        info!(interval_ms = interval.as_millis() as u64, "content writer started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    Arc::clone(&self).flush().await;
                }
            }
        }
        info!("content writer stopped");
    }

    /// Final drain: flush until the pending map empties or a pass makes
    /// no progress (backend down). Intents recorded mid-flush are picked
    /// up by the following pass.
    pub async fn drain(self: Arc<Self>) {
        loop {
            let before = self.pending_count();
            if before == 0 {
                break;
            }
            Arc::clone(&self).flush().await;
            let after = self.pending_count();
            if after >= before {
                warn!(pending = after, "shutdown drain made no progress; leaving intents unflushed");
                break;
            }
        }
    }
}

/// Foreign replicas of one key with fetched content older than `cutoff`.
fn stale_replicas(replicas: &ReplicaMap, local_instance: &str, cutoff: i64) -> Vec<(String, i64)> {
    replicas
        .iter()
        .filter(|(instance, record)| {
            instance.as_str() != local_instance
                && record.value.is_some()
                && record.modified_at < cutoff
        })
        .map(|(instance, record)| (instance.clone(), record.modified_at))
        .collect()
}

/// Of the stale candidates, everything except the single most recent
/// (tie-break: greater instance id). Fewer than two candidates means
/// nothing is collected, so at least one durable backup always remains.
fn select_garbage(mut candidates: Vec<(String, i64)>) -> Vec<String> {
    if candidates.len() < 2 {
        return Vec::new();
    }
    candidates.sort_by(|a, b| (a.1, a.0.as_str()).cmp(&(b.1, b.0.as_str())));
    candidates.pop();
    candidates.into_iter().map(|(instance, _)| instance).collect()
}
