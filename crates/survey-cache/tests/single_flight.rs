//! Concurrency contract for `ResponseCache::get_or_compute`.
//!
//! Many tasks asking for the same fingerprint at once must trigger exactly one
//! compute and all observe the same entry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use survey_cache::{
    CacheError, CacheKey, FsCacheStore, LookupOutcome, ResponseCache, Usage,
};

fn key(prompt: &str) -> CacheKey {
    CacheKey::new("test-model", BTreeMap::new(), "persona", prompt, 0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_keys_compute_once() {
    let cache = Arc::new(ResponseCache::in_memory());
    let calls = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_compute(&key("shared prompt"), false, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, CacheError>(("shared answer".to_string(), Usage::new(20, 4)))
                })
                .await
                .unwrap()
        }));
    }

    let mut outcomes = Vec::new();
    for task in tasks {
        let (entry, outcome) = task.await.unwrap();
        assert_eq!(entry.output, "shared answer");
        assert_eq!(entry.usage, Usage::new(20, 4));
        outcomes.push(outcome);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one underlying compute");
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == LookupOutcome::Computed)
            .count(),
        1
    );
    assert!(outcomes.iter().filter(|o| o.was_hit()).count() == 15);

    let stats = cache.stats();
    assert_eq!(stats.computed, 1);
    assert_eq!(stats.hits + stats.shared, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_compute_independently() {
    let cache = Arc::new(ResponseCache::in_memory());
    let calls = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_compute(&key(&format!("prompt {i}")), false, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CacheError>((format!("answer {i}"), Usage::default()))
                })
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert_eq!(cache.len().unwrap(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_waiters_take_over_after_failed_compute() {
    let cache = Arc::new(ResponseCache::in_memory());
    let calls = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_compute(&key("flaky"), false, || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if n == 0 {
                        Err(CacheError::Backend("first attempt fails".to_string()))
                    } else {
                        Ok(("recovered".to_string(), Usage::default()))
                    }
                })
                .await
        }));
    }

    let mut ok = 0;
    let mut failed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok((entry, _)) => {
                assert_eq!(entry.output, "recovered");
                ok += 1;
            }
            Err(_) => failed += 1,
        }
    }

    assert_eq!(failed, 1);
    assert_eq!(ok, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_fs_backed_cache_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();

    {
        let cache = ResponseCache::new(Arc::new(FsCacheStore::new(dir.path()).unwrap()));
        let (_, outcome) = cache
            .get_or_compute(&key("persisted"), false, || async {
                Ok::<_, CacheError>(("on disk".to_string(), Usage::new(7, 2)))
            })
            .await
            .unwrap();
        assert_eq!(outcome, LookupOutcome::Computed);
    }

    let cache = ResponseCache::new(Arc::new(FsCacheStore::new(dir.path()).unwrap()));
    let (entry, outcome) = cache
        .get_or_compute(&key("persisted"), false, || async {
            Ok::<_, CacheError>(("recomputed".to_string(), Usage::default()))
        })
        .await
        .unwrap();
    assert_eq!(outcome, LookupOutcome::Hit);
    assert_eq!(entry.output, "on disk");
    assert_eq!(entry.usage, Usage::new(7, 2));
}
