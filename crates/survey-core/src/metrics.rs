//! Process-wide counters for survey runs.
//!
//! Counters are bumped at the call site and emitted together by
//! [`Metrics::flush`] at the end of a job.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    model_calls: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    repairs: AtomicU64,
    rate_limit_signals: AtomicU64,
    interviews_finished: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            model_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            repairs: AtomicU64::new(0),
            rate_limit_signals: AtomicU64::new(0),
            interviews_finished: AtomicU64::new(0),
        }
    }

    /// One request actually sent to a provider.
    pub fn inc_model_calls(&self) {
        self.model_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "model_calls", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_repairs(&self) {
        self.repairs.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "repairs", "counter incremented");
    }

    pub fn inc_rate_limit_signals(&self) {
        self.rate_limit_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_interviews_finished(&self) {
        self.interviews_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            model_calls = self.model_calls(),
            cache_hits = self.cache_hits(),
            cache_misses = self.cache_misses(),
            repairs = self.repairs(),
            rate_limit_signals = self.rate_limit_signals(),
            interviews_finished = self.interviews_finished(),
        );
    }

    pub fn model_calls(&self) -> u64 {
        self.model_calls.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn repairs(&self) -> u64 {
        self.repairs.load(Ordering::Relaxed)
    }

    pub fn rate_limit_signals(&self) -> u64 {
        self.rate_limit_signals.load(Ordering::Relaxed)
    }

    pub fn interviews_finished(&self) -> u64 {
        self.interviews_finished.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.model_calls,
            &self.cache_hits,
            &self.cache_misses,
            &self.repairs,
            &self.rate_limit_signals,
            &self.interviews_finished,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_reset() {
        let m = Metrics::new();
        m.inc_model_calls();
        m.inc_model_calls();
        m.inc_cache_hits();
        m.inc_repairs();
        assert_eq!(m.model_calls(), 2);
        assert_eq!(m.cache_hits(), 1);
        assert_eq!(m.repairs(), 1);
        assert_eq!(m.cache_misses(), 0);

        m.reset();
        assert_eq!(m.model_calls(), 0);
        assert_eq!(m.cache_hits(), 0);
    }
}
