//! Storage backends for cache entries.
//!
//! - `CacheStore`: append-only keyed store (put-if-absent / get by fingerprint)
//! - `MemoryCacheStore`: in-process `HashMap` backend
//!
//! The filesystem backend lives in [`crate::fs`].

use std::collections::HashMap;
use std::sync::Mutex;

use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::fingerprint::Fingerprint;

/// Append-only keyed store of [`CacheEntry`] values.
///
/// Guarantees:
/// - `put` never replaces an existing entry; it returns `false` when the
///   fingerprint is already present.
/// - `get` returns exactly the entry first written under the fingerprint.
pub trait CacheStore: Send + Sync {
    /// Store `entry` if its fingerprint is absent. Returns whether it was written.
    fn put(&self, entry: &CacheEntry) -> CacheResult<bool>;

    /// Look up an entry by fingerprint.
    fn get(&self, fingerprint: &Fingerprint) -> CacheResult<Option<CacheEntry>>;

    /// Check for presence without reading the entry.
    fn contains(&self, fingerprint: &Fingerprint) -> CacheResult<bool>;

    /// All entries, ordered by creation time then fingerprint.
    fn entries(&self) -> CacheResult<Vec<CacheEntry>>;

    /// Number of stored entries.
    fn len(&self) -> CacheResult<usize> {
        Ok(self.entries()?.len())
    }

    fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// Sort entries into the order `CacheStore::entries` promises.
pub(crate) fn sort_entries(entries: &mut [CacheEntry]) {
    entries.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
}

// ---------------------------------------------------------------------------
// MemoryCacheStore
// ---------------------------------------------------------------------------

/// In-memory store backed by a `HashMap<Fingerprint, CacheEntry>`.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CacheResult<std::sync::MutexGuard<'_, HashMap<Fingerprint, CacheEntry>>> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Backend("memory store lock poisoned".to_string()))
    }
}

impl CacheStore for MemoryCacheStore {
    fn put(&self, entry: &CacheEntry) -> CacheResult<bool> {
        let mut entries = self.lock()?;
        if entries.contains_key(&entry.fingerprint) {
            return Ok(false);
        }
        entries.insert(entry.fingerprint, entry.clone());
        Ok(true)
    }

    fn get(&self, fingerprint: &Fingerprint) -> CacheResult<Option<CacheEntry>> {
        Ok(self.lock()?.get(fingerprint).cloned())
    }

    fn contains(&self, fingerprint: &Fingerprint) -> CacheResult<bool> {
        Ok(self.lock()?.contains_key(fingerprint))
    }

    fn entries(&self) -> CacheResult<Vec<CacheEntry>> {
        let mut all: Vec<CacheEntry> = self.lock()?.values().cloned().collect();
        sort_entries(&mut all);
        Ok(all)
    }

    fn len(&self) -> CacheResult<usize> {
        Ok(self.lock()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Usage;
    use crate::fingerprint::CacheKey;
    use std::collections::BTreeMap;

    fn entry(prompt: &str, output: &str) -> CacheEntry {
        let key = CacheKey::new("m", BTreeMap::new(), "sys", prompt, 0);
        CacheEntry::new(key, output, Usage::new(1, 1))
    }

    #[test]
    fn put_then_get() {
        let store = MemoryCacheStore::new();
        let e = entry("q", "a");
        assert!(store.put(&e).unwrap());
        assert_eq!(store.get(&e.fingerprint).unwrap(), Some(e));
    }

    #[test]
    fn put_never_replaces() {
        let store = MemoryCacheStore::new();
        let first = entry("q", "first");
        let second = entry("q", "second");
        assert_eq!(first.fingerprint, second.fingerprint);

        assert!(store.put(&first).unwrap());
        assert!(!store.put(&second).unwrap());
        assert_eq!(store.get(&first.fingerprint).unwrap().unwrap().output, "first");
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn missing_entry_is_none() {
        let store = MemoryCacheStore::new();
        let fp = Fingerprint::compute(b"nothing");
        assert!(store.get(&fp).unwrap().is_none());
        assert!(!store.contains(&fp).unwrap());
        assert!(store.is_empty().unwrap());
    }
}
