//! In-memory object storage backend.
//!
//! Reference implementation of [`ObjectStore`] used by the test suites.
//! Uses DashMap for lock-free concurrent access, stamps objects with
//! their creation time, and reports one folder entry per sub-prefix the
//! way hierarchical backends do.
//!
//! Per-operation delay and fault injection are available so failure
//! paths and in-flight races can be exercised deterministically.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{ObjectMeta, ObjectStore};
use crate::error::{Error, Result};

struct StoredObject {
    data: Bytes,
    created_at: i64,
}

/// Operation counters for the in-memory backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Upload operations
    pub uploads: u64,
    /// Download operations
    pub downloads: u64,
    /// Delete operations
    pub deletes: u64,
    /// List operations
    pub lists: u64,
}

/// In-memory [`ObjectStore`] backed by a DashMap
pub struct InMemoryBackend {
    objects: DashMap<String, StoredObject>,
    op_delay: Mutex<Duration>,
    fail_ops: AtomicBool,
    uploads: AtomicU64,
    downloads: AtomicU64,
    deletes: AtomicU64,
    lists: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            objects: DashMap::new(),
            op_delay: Mutex::new(Duration::ZERO),
            fail_ops: AtomicBool::new(false),
            uploads: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            lists: AtomicU64::new(0),
        }
    }
}

impl InMemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every operation (simulates a slow backend)
    pub fn set_op_delay(&self, delay: Duration) {
        *self.op_delay.lock() = delay;
    }

    /// When enabled, every operation fails with a backend error
    pub fn set_fail_ops(&self, fail: bool) {
        self.fail_ops.store(fail, Ordering::Relaxed);
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Sorted paths of all stored objects
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Store an object with an explicit creation timestamp (test seeding)
    pub fn insert_raw(&self, path: impl Into<String>, data: Bytes, created_at: i64) {
        self.objects
            .insert(path.into(), StoredObject { data, created_at });
    }

    /// Operation counters
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            uploads: self.uploads.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            lists: self.lists.load(Ordering::Relaxed),
        }
    }

    async fn guard(&self, op: &str) -> Result<()> {
        let delay = *self.op_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_ops.load(Ordering::Relaxed) {
            return Err(Error::backend(format!("injected {} failure", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryBackend {
    async fn upload(&self, path: &str, data: Bytes) -> Result<()> {
        self.guard("upload").await?;
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.objects.insert(
            path.to_string(),
            StoredObject {
                data,
                created_at: Utc::now().timestamp_millis(),
            },
        );
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Option<Bytes>> {
        self.guard("download").await?;
        self.downloads.fetch_add(1, Ordering::Relaxed);
        Ok(self.objects.get(path).map(|entry| entry.data.clone()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.guard("delete").await?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.objects.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.guard("list").await?;
        self.lists.fetch_add(1, Ordering::Relaxed);

        let mut entries = Vec::new();
        let mut folders: BTreeSet<String> = BTreeSet::new();

        for entry in self.objects.iter() {
            let rest = match entry.key().strip_prefix(prefix) {
                Some(rest) => rest,
                None => continue,
            };
            // Entries with a further separator are reported once as a
            // folder, the way S3 common prefixes work.
            match rest.find('/') {
                Some(i) => {
                    folders.insert(format!("{}{}/", prefix, &rest[..i]));
                }
                None => entries.push(ObjectMeta {
                    path: entry.key().clone(),
                    size: entry.value().data.len() as u64,
                    created_at: entry.value().created_at,
                    is_folder: false,
                }),
            }
        }

        for folder in folders {
            entries.push(ObjectMeta {
                path: folder,
                size: 0,
                created_at: 0,
                is_folder: true,
            });
        }

        Ok(entries)
    }
}
