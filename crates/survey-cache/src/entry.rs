//! Cache records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::{CacheKey, Fingerprint};

/// Token counts reported for one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// One stored model response.
///
/// Entries are immutable: a store never replaces the entry filed under a
/// fingerprint once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub key: CacheKey,
    pub output: String,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Build an entry for `key`, stamping the current time.
    pub fn new(key: CacheKey, output: impl Into<String>, usage: Usage) -> Self {
        Self {
            fingerprint: key.fingerprint(),
            key,
            output: output.into(),
            usage,
            created_at: Utc::now(),
        }
    }

    /// True when the stored fingerprint matches the key it was computed from.
    pub fn is_consistent(&self) -> bool {
        self.key.fingerprint() == self.fingerprint
    }
}
