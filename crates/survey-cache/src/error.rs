//! Error types for survey-cache

use thiserror::Error;

use crate::fingerprint::Fingerprint;

/// Errors that can occur in the cache storage layer
#[derive(Error, Debug)]
pub enum CacheError {
    /// Entry not found
    #[error("cache entry not found: {0}")]
    NotFound(Fingerprint),

    /// Malformed fingerprint string
    #[error("invalid fingerprint hex: {0}")]
    InvalidFingerprint(String),

    /// Stored entry does not hash to the fingerprint it is filed under
    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific failure
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;
