//! Object storage backend abstraction.
//!
//! The cache layer consumes the backend as an abstract capability:
//! upload, download, delete, and a listing that reports size and
//! modification time. Concrete implementations cover S3-compatible
//! buckets, alternative blob networks, and the in-memory store used by
//! the test suites. Used as `Arc<dyn ObjectStore>`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

mod memory;

pub use memory::{BackendStats, InMemoryBackend};

/// Metadata for one entry returned by [`ObjectStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Full object path
    pub path: String,
    /// Payload size in bytes
    pub size: u64,
    /// Creation / last-modification time, epoch milliseconds
    pub created_at: i64,
    /// True for logical containers ("folders") reported by hierarchical
    /// backends; such entries carry no payload
    pub is_folder: bool,
}

impl ObjectMeta {
    /// Last path segment (the replica instance id or the tombstone flag).
    pub fn basename(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rsplit_once('/') {
            Some((_, name)) => name,
            None => trimmed,
        }
    }
}

/// Storage backend capability consumed by the cache layer.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a blob, overwriting any existing object at `path`.
    async fn upload(&self, path: &str, data: Bytes) -> Result<()>;

    /// Download a blob. Returns `None` if the object does not exist.
    async fn download(&self, path: &str) -> Result<Option<Bytes>>;

    /// Delete a blob. Deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// List entries directly under `prefix`, including folder entries
    /// for hierarchical backends.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: 0,
            created_at: 0,
            is_folder: false,
        }
    }

    #[test]
    fn test_basename_of_replica_path() {
        assert_eq!(meta("orders/instance-a").basename(), "instance-a");
    }

    #[test]
    fn test_basename_of_folder_entry() {
        assert_eq!(meta("orders/nested/").basename(), "nested");
    }

    #[test]
    fn test_basename_of_bare_name() {
        assert_eq!(meta("orders").basename(), "orders");
    }

    #[test]
    fn test_basename_of_nested_logical_key() {
        assert_eq!(meta("tenant/orders/instance-a").basename(), "instance-a");
    }
}
