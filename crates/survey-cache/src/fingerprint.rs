//! Call fingerprints: the content address of one model call.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::error::CacheError;

/// SHA-256 digest used as a cache address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the SHA-256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form (first 12 hex chars), for logs.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = CacheError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CacheError::InvalidFingerprint(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(CacheError::InvalidFingerprint(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Everything that determines a model call's output.
///
/// Two keys with equal fields always produce the same [`Fingerprint`].
/// `parameters` is a `BTreeMap` so that insertion order never leaks into the
/// hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheKey {
    pub model: String,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub iteration: u32,
}

impl CacheKey {
    pub fn new(
        model: impl Into<String>,
        parameters: BTreeMap<String, serde_json::Value>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        iteration: u32,
    ) -> Self {
        Self {
            model: model.into(),
            parameters,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            iteration,
        }
    }

    /// Content address of this key.
    pub fn fingerprint(&self) -> Fingerprint {
        // Struct field order is fixed and maps serialize sorted, so the
        // encoding is canonical for a given key.
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        Fingerprint::compute(&encoded)
    }
}
