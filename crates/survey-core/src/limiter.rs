//! Per-model rate limiting.
//!
//! Each model identity gets a [`ModelLimiter`] holding two token buckets:
//! requests and tokens. A bucket for a per-minute limit `L` holds at most
//! `C = max(1, floor(L * burst_fraction))` units and refills at
//! `(L - C) / 60` units per second, so no 60-second window admits more than
//! `L` units (for `L >= 2`).
//!
//! Admission is FIFO: waiters queue on an async gate and only the head of
//! the queue polls the buckets. Provider rate-limit signals shrink the refill
//! rate multiplicatively; successes grow it back additively.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::model::{ModelInfo, RateLimits};

const MAX_SINGLE_WAIT: Duration = Duration::from_secs(3600);

/// Bucket shape and AIMD tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimiterConfig {
    /// Fraction of the per-minute limit that may be spent in a burst.
    pub burst_fraction: f64,
    /// Multiplier applied to the refill rate on a rate-limit signal.
    pub decrease_factor: f64,
    /// Fraction of the declared rate restored per successful call.
    pub increase_fraction: f64,
    /// Floor for the refill rate, as a fraction of the declared rate.
    pub min_rate_fraction: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            burst_fraction: 0.1,
            decrease_factor: 0.5,
            increase_fraction: 0.05,
            min_rate_fraction: 0.1,
        }
    }
}

// ---- Bucket ----

#[derive(Debug, Clone)]
struct Bucket {
    capacity: f64,
    balance: f64,
    /// Declared refill rate, units per second.
    nominal_rate: f64,
    /// Current refill rate after AIMD adjustments.
    rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn per_minute(limit: u64, config: &LimiterConfig, now: Instant) -> Self {
        let limit = limit.max(1) as f64;
        let capacity = (limit * config.burst_fraction).floor().clamp(1.0, limit);
        let nominal_rate = (limit - capacity).max(1.0) / 60.0;
        Self {
            capacity,
            balance: capacity,
            nominal_rate,
            rate: nominal_rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.balance = (self.balance + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Requests larger than the bucket are admitted once it is full.
    fn needed(&self, amount: f64) -> f64 {
        amount.min(self.capacity)
    }

    fn wait_for(&self, amount: f64) -> Duration {
        let deficit = self.needed(amount) - self.balance;
        if deficit <= 1e-9 {
            return Duration::ZERO;
        }
        // Round up to whole milliseconds so a wake-up never lands early.
        let millis = (deficit / self.rate * 1000.0).ceil();
        Duration::try_from_secs_f64(millis / 1000.0)
            .unwrap_or(MAX_SINGLE_WAIT)
            .min(MAX_SINGLE_WAIT)
    }

    fn take(&mut self, amount: f64) {
        self.balance -= amount;
    }

    fn credit(&mut self, amount: f64) {
        self.balance = (self.balance + amount).min(self.capacity);
    }

    fn decrease(&mut self, config: &LimiterConfig) {
        let floor = self.nominal_rate * config.min_rate_fraction;
        self.rate = (self.rate * config.decrease_factor).max(floor);
    }

    fn increase(&mut self, config: &LimiterConfig) {
        self.rate = (self.rate + self.nominal_rate * config.increase_fraction).min(self.nominal_rate);
    }
}

#[derive(Debug)]
struct BucketPair {
    requests: Option<Bucket>,
    tokens: Option<Bucket>,
}

impl BucketPair {
    fn buckets_mut(&mut self) -> impl Iterator<Item = &mut Bucket> {
        self.requests.iter_mut().chain(self.tokens.iter_mut())
    }
}

// ---- Model limiter ----

/// Rate limiter shared by every interview that targets one model.
#[derive(Debug)]
pub struct ModelLimiter {
    model: String,
    config: LimiterConfig,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<BucketPair>,
}

impl ModelLimiter {
    pub fn new(model: impl Into<String>, limits: RateLimits, config: LimiterConfig) -> Self {
        let now = Instant::now();
        let state = BucketPair {
            requests: limits
                .requests_per_minute
                .map(|l| Bucket::per_minute(l, &config, now)),
            tokens: limits
                .tokens_per_minute
                .map(|l| Bucket::per_minute(l, &config, now)),
        };
        Self {
            model: model.into(),
            config,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(state),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BucketPair> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Wait until one request of roughly `estimated_tokens` fits in both
    /// buckets, then debit it. Returns the time spent waiting.
    pub async fn acquire(&self, estimated_tokens: u64) -> Duration {
        let started = Instant::now();
        let tokens = estimated_tokens as f64;
        let (_turn, mut waited) = match self.gate.try_lock() {
            Ok(turn) => (turn, false),
            Err(_) => (self.gate.lock().await, true),
        };

        loop {
            let wait = {
                let mut state = self.lock_state();
                let now = Instant::now();
                state.buckets_mut().for_each(|b| b.refill(now));

                let request_wait = state.requests.as_ref().map(|b| b.wait_for(1.0));
                let token_wait = state.tokens.as_ref().map(|b| b.wait_for(tokens));
                let wait = request_wait
                    .into_iter()
                    .chain(token_wait)
                    .max()
                    .unwrap_or(Duration::ZERO);

                if wait.is_zero() {
                    if let Some(b) = state.requests.as_mut() {
                        b.take(1.0);
                    }
                    if let Some(b) = state.tokens.as_mut() {
                        b.take(tokens);
                    }
                    None
                } else {
                    Some(wait)
                }
            };

            match wait {
                None if waited => return started.elapsed(),
                None => return Duration::ZERO,
                Some(wait) => {
                    tracing::trace!(model = %self.model, ?wait, "waiting for capacity");
                    tokio::time::sleep(wait).await;
                    waited = true;
                }
            }
        }
    }

    /// Settle the token bucket once the real usage of a call is known.
    pub fn reconcile(&self, estimated_tokens: u64, actual_tokens: u64) {
        let mut state = self.lock_state();
        if let Some(bucket) = state.tokens.as_mut() {
            if estimated_tokens >= actual_tokens {
                bucket.credit((estimated_tokens - actual_tokens) as f64);
            } else {
                bucket.take((actual_tokens - estimated_tokens) as f64);
            }
        }
    }

    /// Multiplicative decrease after a provider rate-limit signal.
    pub fn on_rate_limited(&self) {
        let mut state = self.lock_state();
        let config = &self.config;
        state.buckets_mut().for_each(|b| b.decrease(config));
        let rpm = state.requests.as_ref().map(|b| b.rate * 60.0);
        drop(state);
        crate::obs::emit_limiter_backoff(&self.model, rpm);
    }

    /// Additive increase after a successful call.
    pub fn on_success(&self) {
        let mut state = self.lock_state();
        let config = &self.config;
        state.buckets_mut().for_each(|b| b.increase(config));
    }

    /// Burst capacity of the request bucket, if limited.
    pub fn request_capacity(&self) -> Option<u64> {
        self.lock_state().requests.as_ref().map(|b| b.capacity as u64)
    }

    /// Current request refill rate in requests per second.
    pub fn request_rate(&self) -> Option<f64> {
        self.lock_state().requests.as_ref().map(|b| b.rate)
    }

    /// Current token refill rate in tokens per second.
    pub fn token_rate(&self) -> Option<f64> {
        self.lock_state().tokens.as_ref().map(|b| b.rate)
    }

    pub fn available_tokens(&self) -> Option<f64> {
        let mut state = self.lock_state();
        let now = Instant::now();
        state.tokens.as_mut().map(|b| {
            b.refill(now);
            b.balance
        })
    }
}

// ---- Collection ----

/// One [`ModelLimiter`] per model identity, created on first use.
#[derive(Debug, Default)]
pub struct BucketCollection {
    config: LimiterConfig,
    limiters: Mutex<HashMap<String, Arc<ModelLimiter>>>,
}

impl BucketCollection {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn limiter_for(&self, model: &ModelInfo) -> Arc<ModelLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(limiters.entry(model.id.clone()).or_insert_with(|| {
            Arc::new(ModelLimiter::new(&model.id, model.limits, self.config.clone()))
        }))
    }
}
