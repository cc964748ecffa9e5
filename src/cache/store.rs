//! Key-Value Store - Single-Object Backend Access
//!
//! The leaf component: serializes one value, optionally encrypts it, and
//! performs upload/download/delete/list against the storage backend.
//! Every operation logs success or failure; backend faults propagate to
//! the caller. No retry lives at this layer.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, error};

use crate::backend::{ObjectMeta, ObjectStore};
use crate::cipher::{ContentCipher, SecretKey};
use crate::error::Result;

/// Typed single-object access over the storage backend.
#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn ObjectStore>,
    cipher: Arc<dyn ContentCipher>,
}

impl KvStore {
    /// Create a store over `backend` using `cipher` for encrypted values
    pub fn new(backend: Arc<dyn ObjectStore>, cipher: Arc<dyn ContentCipher>) -> Self {
        Self { backend, cipher }
    }

    /// Serialize and upload one value. With a secret the payload is
    /// encrypted; without one it passes through as plain JSON (used for
    /// tombstones, whose payload is `null`).
    pub async fn set(&self, path: &str, value: &Value, secret: Option<&SecretKey>) -> Result<()> {
        let mut payload = serde_json::to_vec(value)?;
        if let Some(secret) = secret {
            payload = self.cipher.encrypt(secret, &payload)?;
        }
        let size = payload.len();

        match self.backend.upload(path, Bytes::from(payload)).await {
            Ok(()) => {
                debug!(path, size, encrypted = secret.is_some(), "stored object");
                Ok(())
            }
            Err(e) => {
                error!(path, error = %e, "failed to store object");
                Err(e)
            }
        }
    }

    /// Download and decode one value. A missing object yields `Ok(None)`.
    pub async fn get(&self, path: &str, secret: Option<&SecretKey>) -> Result<Option<Value>> {
        let data = match self.backend.download(path).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!(path, "object not found");
                return Ok(None);
            }
            Err(e) => {
                error!(path, error = %e, "failed to fetch object");
                return Err(e);
            }
        };

        let plaintext = match secret {
            Some(secret) => self.cipher.decrypt(secret, &data)?,
            None => data.to_vec(),
        };
        let value = serde_json::from_slice(&plaintext)?;
        debug!(path, size = data.len(), "fetched object");
        Ok(Some(value))
    }

    /// Delete one object
    pub async fn delete(&self, path: &str) -> Result<()> {
        match self.backend.delete(path).await {
            Ok(()) => {
                debug!(path, "deleted object");
                Ok(())
            }
            Err(e) => {
                error!(path, error = %e, "failed to delete object");
                Err(e)
            }
        }
    }

    /// List leaf blobs under `prefix`. Folder entries reported by
    /// hierarchical backends are filtered out.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        match self.backend.list(prefix).await {
            Ok(entries) => {
                let leaves: Vec<ObjectMeta> =
                    entries.into_iter().filter(|e| !e.is_folder).collect();
                debug!(prefix, count = leaves.len(), "listed objects");
                Ok(leaves)
            }
            Err(e) => {
                error!(prefix, error = %e, "failed to list objects");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::cipher::Aes256GcmCipher;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn make_store() -> (Arc<InMemoryBackend>, KvStore) {
        let backend = Arc::new(InMemoryBackend::new());
        let store = KvStore::new(backend.clone(), Arc::new(Aes256GcmCipher));
        (backend, store)
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip() {
        let (backend, store) = make_store();
        let secret = SecretKey::derive("swordfish");
        let value = json!({ "message": "hi" });

        assert_ok!(store.set("k/a", &value, Some(&secret)).await);

        // The stored bytes are not the plain serialization.
        let raw = backend.download("k/a").await.unwrap().unwrap();
        assert_ne!(raw.as_ref(), serde_json::to_vec(&value).unwrap().as_slice());

        let fetched = store.get("k/a", Some(&secret)).await.unwrap();
        assert_eq!(fetched, Some(value));
    }

    #[tokio::test]
    async fn test_plain_roundtrip() {
        let (backend, store) = make_store();

        store.set("k/deleted", &Value::Null, None).await.unwrap();

        let raw = backend.download("k/deleted").await.unwrap().unwrap();
        assert_eq!(raw.as_ref(), b"null");
        assert_eq!(store.get("k/deleted", None).await.unwrap(), Some(Value::Null));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_backend, store) = make_store();
        let secret = SecretKey::derive("swordfish");
        assert_eq!(store.get("k/missing", Some(&secret)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_cipher_error() {
        let (_backend, store) = make_store();
        let value = json!(42);

        store
            .set("k/a", &value, Some(&SecretKey::derive("swordfish")))
            .await
            .unwrap();

        let result = store.get("k/a", Some(&SecretKey::derive("marlin"))).await;
        assert_matches!(result, Err(Error::Cipher(_)));
    }

    #[tokio::test]
    async fn test_list_excludes_folders() {
        let (backend, store) = make_store();

        backend
            .upload("k/a", Bytes::from_static(b"1"))
            .await
            .unwrap();
        backend
            .upload("k/nested/b", Bytes::from_static(b"2"))
            .await
            .unwrap();

        let entries = store.list("k/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "k/a");
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        let (backend, store) = make_store();
        backend.set_fail_ops(true);

        let secret = SecretKey::derive("swordfish");
        assert_matches!(
            store.set("k/a", &json!(1), Some(&secret)).await,
            Err(Error::Backend(_))
        );
        assert_matches!(
            store.get("k/a", Some(&secret)).await,
            Err(Error::Backend(_))
        );
        assert_matches!(store.list("k/").await, Err(Error::Backend(_)));
    }
}
