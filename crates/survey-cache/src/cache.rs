//! Single-flight response cache.
//!
//! [`ResponseCache::get_or_compute`] guarantees that at most one compute runs
//! per fingerprint at a time. Concurrent requesters of the same fingerprint
//! wait on the running compute and receive its entry, reported as a hit.

use std::collections::HashMap;
use std::future::Future;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::entry::{CacheEntry, Usage};
use crate::error::{CacheError, CacheResult};
use crate::fingerprint::{CacheKey, Fingerprint};
use crate::store::{CacheStore, MemoryCacheStore};

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupOutcome {
    /// Read from the store.
    Hit,
    /// Joined another task's in-flight compute for the same fingerprint.
    Shared,
    /// Computed by this caller.
    Computed,
}

impl LookupOutcome {
    /// True when the caller did not run the compute itself.
    pub fn was_hit(self) -> bool {
        !matches!(self, LookupOutcome::Computed)
    }
}

/// Hit/miss counters for one cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub shared: u64,
    pub computed: u64,
    pub writes: u64,
}

type InflightMap = HashMap<Fingerprint, Arc<OnceCell<CacheEntry>>>;

/// Content-addressed cache of model responses with dogpile prevention.
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    inflight: Mutex<InflightMap>,
    hits: AtomicU64,
    shared: AtomicU64,
    computed: AtomicU64,
    writes: AtomicU64,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            shared: AtomicU64::new(0),
            computed: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Cache backed by a fresh [`MemoryCacheStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()))
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Plain lookup without computing.
    pub fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        self.store.get(&key.fingerprint())
    }

    /// Return the entry for `key`, running `compute` only if no entry exists
    /// and no other task is already computing it.
    ///
    /// With `bypass`, the store is not consulted and `compute` always runs;
    /// the fresh result is offered to the store, which keeps any entry it
    /// already holds for the fingerprint.
    ///
    /// A failed compute is not cached. Tasks that were waiting on it retry the
    /// compute one at a time.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &CacheKey,
        bypass: bool,
        compute: F,
    ) -> Result<(CacheEntry, LookupOutcome), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Usage), E>>,
        E: From<CacheError>,
    {
        let fingerprint = key.fingerprint();

        if bypass {
            let (output, usage) = compute().await?;
            let entry = CacheEntry::new(key.clone(), output, usage);
            self.write(&entry)?;
            self.computed.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %fingerprint.short(), "cache bypassed");
            return Ok((entry, LookupOutcome::Computed));
        }

        if let Some(entry) = self.store.get(&fingerprint)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(fingerprint = %fingerprint.short(), "cache hit");
            return Ok((entry, LookupOutcome::Hit));
        }

        let cell = self.inflight_cell(fingerprint)?;
        let _release = InflightRelease {
            cache: self,
            fingerprint: &fingerprint,
            cell: &cell,
        };
        let ran_compute = AtomicBool::new(false);
        let found_stored = AtomicBool::new(false);

        let result = {
            let ran_compute = &ran_compute;
            let found_stored = &found_stored;
            let store = &self.store;
            cell.get_or_try_init(|| async move {
                // A compute for this fingerprint may have finished and left
                // the in-flight map between our store check and now.
                if let Some(entry) = store.get(&fingerprint)? {
                    found_stored.store(true, Ordering::Relaxed);
                    return Ok(entry);
                }
                ran_compute.store(true, Ordering::Relaxed);
                let (output, usage) = compute().await?;
                let entry = CacheEntry::new(key.clone(), output, usage);
                self.write(&entry)?;
                Ok::<CacheEntry, E>(entry)
            })
            .await
            .cloned()
        };

        let entry = result?;

        let outcome = if ran_compute.load(Ordering::Relaxed) {
            self.computed.fetch_add(1, Ordering::Relaxed);
            LookupOutcome::Computed
        } else if found_stored.load(Ordering::Relaxed) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            LookupOutcome::Hit
        } else {
            self.shared.fetch_add(1, Ordering::Relaxed);
            LookupOutcome::Shared
        };
        trace!(fingerprint = %fingerprint.short(), ?outcome, "cache lookup resolved");
        Ok((entry, outcome))
    }

    fn write(&self, entry: &CacheEntry) -> CacheResult<()> {
        if self.store.put(entry)? {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn inflight_cell(&self, fingerprint: Fingerprint) -> CacheResult<Arc<OnceCell<CacheEntry>>> {
        let mut inflight = self
            .inflight
            .lock()
            .map_err(|_| CacheError::Backend("in-flight map lock poisoned".to_string()))?;
        Ok(Arc::clone(
            inflight
                .entry(fingerprint)
                .or_insert_with(|| Arc::new(OnceCell::new())),
        ))
    }

    fn release_inflight(&self, fingerprint: &Fingerprint, cell: &Arc<OnceCell<CacheEntry>>) {
        let Ok(mut inflight) = self.inflight.lock() else {
            return;
        };
        let Some(current) = inflight.get(fingerprint) else {
            return;
        };
        if !Arc::ptr_eq(current, cell) {
            return;
        }
        // An empty cell stays while queued waiters hold it, so one of them
        // can take over the compute. Clones are only made under this lock.
        if cell.initialized() || Arc::strong_count(cell) == 2 {
            inflight.remove(fingerprint);
        }
    }

    /// Snapshot of the hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            shared: self.shared.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    /// Number of entries in the underlying store.
    pub fn len(&self) -> CacheResult<usize> {
        self.store.len()
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        self.store.is_empty()
    }

    /// Write every entry as one JSON object per line.
    pub fn export_jsonl<W: Write>(&self, mut writer: W) -> CacheResult<usize> {
        let entries = self.store.entries()?;
        for entry in &entries {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(entries.len())
    }

    /// Load entries from JSONL, skipping fingerprints already present.
    ///
    /// Returns the number of entries newly written. Lines whose fingerprint
    /// does not match their key are rejected.
    pub fn import_jsonl<R: BufRead>(&self, reader: R) -> CacheResult<usize> {
        let mut written = 0;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: CacheEntry = serde_json::from_str(&line)?;
            if !entry.is_consistent() {
                return Err(CacheError::FingerprintMismatch {
                    expected: entry.fingerprint.to_hex(),
                    actual: entry.key.fingerprint().to_hex(),
                });
            }
            if self.store.put(&entry)? {
                written += 1;
            }
        }
        Ok(written)
    }
}

/// Drops the caller's claim on an in-flight cell, whether the lookup
/// finished, failed, or was cancelled.
struct InflightRelease<'a> {
    cache: &'a ResponseCache,
    fingerprint: &'a Fingerprint,
    cell: &'a Arc<OnceCell<CacheEntry>>,
}

impl Drop for InflightRelease<'_> {
    fn drop(&mut self) {
        self.cache.release_inflight(self.fingerprint, self.cell);
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;

    fn key(prompt: &str, iteration: u32) -> CacheKey {
        CacheKey::new("test-model", BTreeMap::new(), "sys", prompt, iteration)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = ResponseCache::in_memory();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let (first, outcome) = cache
            .get_or_compute(&key("q", 0), false, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(("yes".to_string(), Usage::new(5, 1)))
            })
            .await
            .unwrap();
        assert_eq!(outcome, LookupOutcome::Computed);
        assert!(!outcome.was_hit());

        let (second, outcome) = cache
            .get_or_compute(&key("q", 0), false, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(("no".to_string(), Usage::new(5, 1)))
            })
            .await
            .unwrap();
        assert_eq!(outcome, LookupOutcome::Hit);
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.computed, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.writes, 1);
    }

    #[tokio::test]
    async fn iteration_is_part_of_the_key() {
        let cache = ResponseCache::in_memory();
        for i in 0..3 {
            let (_, outcome) = cache
                .get_or_compute(&key("same prompt", i), false, || async move {
                    Ok::<_, CacheError>((format!("sample {i}"), Usage::default()))
                })
                .await
                .unwrap();
            assert_eq!(outcome, LookupOutcome::Computed);
        }
        assert_eq!(cache.len().unwrap(), 3);
    }

    #[tokio::test]
    async fn bypass_recomputes_but_keeps_first_entry() {
        let cache = ResponseCache::in_memory();
        cache
            .get_or_compute(&key("q", 0), false, || async {
                Ok::<_, CacheError>(("first".to_string(), Usage::default()))
            })
            .await
            .unwrap();

        let (fresh, outcome) = cache
            .get_or_compute(&key("q", 0), true, || async {
                Ok::<_, CacheError>(("second".to_string(), Usage::default()))
            })
            .await
            .unwrap();
        assert_eq!(outcome, LookupOutcome::Computed);
        assert_eq!(fresh.output, "second");
        assert_eq!(cache.get(&key("q", 0)).unwrap().unwrap().output, "first");
    }

    #[tokio::test]
    async fn failed_compute_is_not_cached() {
        let cache = ResponseCache::in_memory();
        let err = cache
            .get_or_compute(&key("q", 0), false, || async {
                Err::<(String, Usage), _>(CacheError::Backend("boom".to_string()))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(cache.is_empty().unwrap());

        let (entry, outcome) = cache
            .get_or_compute(&key("q", 0), false, || async {
                Ok::<_, CacheError>(("ok".to_string(), Usage::default()))
            })
            .await
            .unwrap();
        assert_eq!(outcome, LookupOutcome::Computed);
        assert_eq!(entry.output, "ok");
    }

    #[tokio::test]
    async fn failed_and_cancelled_computes_leave_no_inflight_cell() {
        let cache = ResponseCache::in_memory();
        for i in 0..5 {
            let _ = cache
                .get_or_compute(&key("failing", i), false, || async {
                    Err::<(String, Usage), _>(CacheError::Backend("boom".to_string()))
                })
                .await;
        }
        assert!(cache.inflight.lock().unwrap().is_empty());

        let stalled_key = key("stalled", 0);
        let stalled = cache.get_or_compute(&stalled_key, false, || async {
            std::future::pending::<Result<(String, Usage), CacheError>>().await
        });
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), stalled).await;
        assert!(timed_out.is_err());
        assert!(cache.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn jsonl_export_import_roundtrip() {
        let source = ResponseCache::in_memory();
        for p in ["a", "b", "c"] {
            source
                .get_or_compute(&key(p, 0), false, || async move {
                    Ok::<_, CacheError>((format!("out-{p}"), Usage::new(1, 1)))
                })
                .await
                .unwrap();
        }

        let mut buf = Vec::new();
        assert_eq!(source.export_jsonl(&mut buf).unwrap(), 3);

        let target = ResponseCache::in_memory();
        assert_eq!(target.import_jsonl(buf.as_slice()).unwrap(), 3);
        assert_eq!(target.import_jsonl(buf.as_slice()).unwrap(), 0);
        assert_eq!(
            target.get(&key("b", 0)).unwrap().unwrap().output,
            "out-b".to_string()
        );
    }
}
