//! Replicastor - Replicated Key-Value Cache over Object Storage
//!
//! A cache layer in front of an eventually-consistent, multi-writer
//! object-storage backend (S3-compatible buckets, decentralized blob
//! networks). Multiple independent process instances share one logical
//! key space; each instance holds and writes only its own replica of a
//! value, observes its own writes immediately, observes other instances'
//! writes within a bounded delay, and reclaims storage for stale
//! replicas. There is no central coordinator or locking service:
//! instances converge by polling the shared backend.
//!
//! # Architecture
//!
//! Four components composed bottom-up:
//!
//! ```text
//! CacheCoordinator ──▶ MetadataReader ──▶ ObjectStore (listings)
//!        │
//!        └──────────▶ ContentWriter ──▶ KvStore ──▶ ObjectStore + ContentCipher
//! ```
//!
//! Writes mutate the in-memory replica immediately and flush to the
//! backend in batched cycles; reads consult memory and pull missing
//! foreign content synchronously; a periodic reconciliation loop
//! discovers foreign writes and tombstones and publishes change
//! notifications.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use replicastor::{CacheConfig, CacheCoordinator, InMemoryBackend, SecretKey};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> replicastor::Result<()> {
//! let backend = Arc::new(InMemoryBackend::new());
//! let coordinator = CacheCoordinator::new(CacheConfig::default(), backend)?;
//! let secret = SecretKey::derive("swordfish");
//!
//! coordinator.set("greeting", json!({ "message": "hi" }), &secret)?;
//!
//! // The local write is visible immediately.
//! let values = coordinator.get("greeting", &secret).await?.unwrap();
//! assert_eq!(values[0], Some(json!({ "message": "hi" })));
//!
//! // Flush pending writes and stop.
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`backend`] - object storage abstraction and the in-memory backend
//! - [`cache`] - the four cache components
//! - [`cipher`] - content encryption
//! - [`config`] - coordinator configuration
//! - [`error`] - error types

pub mod backend;
pub mod cache;
pub mod cipher;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use backend::{InMemoryBackend, ObjectMeta, ObjectStore};
pub use cache::{
    CacheCoordinator, CacheEvent, CacheStatsSnapshot, InstanceUpdates, KvStore, MetadataReader,
    Subscription,
};
pub use cipher::{Aes256GcmCipher, ContentCipher, PlaintextCipher, SecretKey};
pub use config::CacheConfig;
pub use error::{Error, Result};
