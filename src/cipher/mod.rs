//! Content encryption for cached values.
//!
//! Values are encrypted under a caller-supplied symmetric key before they
//! reach the storage backend; the backend only ever sees opaque bytes.
//! The cipher is an abstract capability: AES-256-GCM for encrypted
//! deployments, pass-through for unencrypted ones.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Symmetric key length in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes (96-bit GCM nonce)
const NONCE_LEN: usize = 12;

/// Symmetric key material for one logical key's values.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Wrap raw key material
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive a key from a passphrase (SHA-256 digest)
    pub fn derive(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        Self(digest.into())
    }

    /// Raw key material
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        write!(f, "SecretKey(..)")
    }
}

/// Encrypts and decrypts serialized values under a caller-supplied key.
pub trait ContentCipher: Send + Sync {
    /// Encrypt a serialized value
    fn encrypt(&self, key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a payload previously produced by [`encrypt`](Self::encrypt)
    fn decrypt(&self, key: &SecretKey, data: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM with a random 96-bit nonce prepended to the ciphertext.
pub struct Aes256GcmCipher;

impl ContentCipher for Aes256GcmCipher {
    fn encrypt(&self, key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(key.as_bytes().into());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::cipher("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &SecretKey, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::cipher("payload shorter than nonce"));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(key.as_bytes().into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::cipher("decryption failed (wrong key or corrupted payload)"))
    }
}

/// Pass-through cipher for unencrypted deployments.
pub struct PlaintextCipher;

impl ContentCipher for PlaintextCipher {
    fn encrypt(&self, _key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, _key: &SecretKey, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
