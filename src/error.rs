//! Error types for the replicated cache layer.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the replicated cache layer
#[derive(Error, Debug)]
pub enum Error {
    /// Write attempted on a key that was deleted on this instance
    #[error("object deleted: {0}")]
    ObjectDeleted(String),

    /// Storage backend failure (network, permissions, not-found-on-write)
    #[error("backend error: {0}")]
    Backend(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encrypt or decrypt failure (wrong key, corrupted payload)
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Value (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a cipher error
    pub fn cipher(msg: impl Into<String>) -> Self {
        Self::Cipher(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
