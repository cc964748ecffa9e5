//! Configuration for the cache coordinator.

use std::time::Duration;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Configuration consumed by the cache coordinator and its components.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Identity of this process instance. Becomes the object name of the
    /// local replica under each logical key, so it must never collide
    /// with `deleted_flag`.
    pub instance_id: String,

    /// Maximum number of logical keys held in memory
    pub max_keys: usize,

    /// Interval between content flush cycles; `Duration::ZERO` disables
    /// the periodic flush
    pub write_interval: Duration,

    /// Interval between reconciliation cycles; `Duration::ZERO` disables
    /// background reconciliation
    pub read_interval: Duration,

    /// Name of the tombstone marker object
    pub deleted_flag: String,

    /// Fan-out limit for background metadata reads
    pub read_metadata_concurrency: usize,

    /// Fan-out limit for background content writes
    pub write_content_concurrency: usize,

    /// Age threshold beyond which redundant foreign replicas qualify for
    /// garbage collection
    pub cache_expiration: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().simple().to_string(),
            max_keys: 1024,
            write_interval: Duration::from_secs(30),
            read_interval: Duration::from_secs(30),
            deleted_flag: "deleted".to_string(),
            read_metadata_concurrency: 16,
            write_content_concurrency: 16,
            cache_expiration: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.is_empty() {
            return Err(Error::config("instance_id must not be empty"));
        }
        if self.deleted_flag.is_empty() {
            return Err(Error::config("deleted_flag must not be empty"));
        }
        if self.instance_id == self.deleted_flag {
            return Err(Error::config(
                "instance_id must not collide with deleted_flag",
            ));
        }
        if self.instance_id.contains('/') {
            return Err(Error::config("instance_id must not contain '/'"));
        }
        if self.max_keys == 0 {
            return Err(Error::config("max_keys must be > 0"));
        }
        if self.read_metadata_concurrency == 0 {
            return Err(Error::config("read_metadata_concurrency must be > 0"));
        }
        if self.write_content_concurrency == 0 {
            return Err(Error::config("write_content_concurrency must be > 0"));
        }
        Ok(())
    }
}
