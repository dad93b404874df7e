//! Call controls: per-attempt timeout, retry with exponential backoff, and
//! a separate budget for provider rate-limit signals.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Retry and timeout settings for model calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallControls {
    /// Maximum wall-clock time for a single model call (milliseconds).
    pub timeout_ms: u64,
    /// Retries for transient failures and timeouts (0 = run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
    /// Upper bound on any single backoff delay (milliseconds).
    pub max_backoff_ms: u64,
    /// Rate-limit signals tolerated before giving up. These do not consume
    /// `max_retries`.
    pub max_rate_limit_retries: u32,
}

impl Default for CallControls {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_retries: 2,
            backoff_base_ms: 500,
            max_backoff_ms: 30_000,
            max_rate_limit_retries: 10,
        }
    }
}

impl CallControls {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    /// Run `fut` under the per-call timeout.
    pub async fn with_timeout<T, Fut>(&self, fut: Fut) -> Result<T, ModelError>
    where
        Fut: Future<Output = Result<T, ModelError>>,
    {
        match tokio::time::timeout(self.timeout(), fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ModelError::Timeout {
                limit_ms: self.timeout_ms,
            }),
        }
    }
}

/// What a controlled call returned, with attempt accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Controlled<T> {
    pub value: T,
    /// Total attempts made (1 = first try succeeded).
    pub attempts: u32,
    /// Attempts rejected by a provider rate limit.
    pub rate_limited: u32,
}

/// Execute `op` with retry controls.
///
/// `op` receives the 1-based attempt number. Transient errors and timeouts
/// are retried up to `max_retries` times with exponential backoff. Rate-limit
/// signals wait for the provider's `retry_after` (or the backoff schedule)
/// and are counted against `max_rate_limit_retries` instead.
pub async fn execute_with_controls<T, F, Fut>(
    controls: &CallControls,
    mut op: F,
) -> Result<Controlled<T>, ModelError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut attempt = 0u32;
    let mut retries = 0u32;
    let mut rate_limited = 0u32;

    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => {
                return Ok(Controlled {
                    value,
                    attempts: attempt,
                    rate_limited,
                })
            }
            Err(err) => err,
        };

        let delay = match &err {
            ModelError::RateLimited { retry_after } => {
                rate_limited += 1;
                if rate_limited > controls.max_rate_limit_retries {
                    return Err(err);
                }
                retry_after.unwrap_or_else(|| controls.backoff(rate_limited))
            }
            e if e.is_retryable() => {
                retries += 1;
                if retries > controls.max_retries {
                    return Err(err);
                }
                controls.backoff(retries)
            }
            _ => return Err(err),
        };

        tracing::debug!(attempt, ?delay, error = %err, "retrying model call");
        tokio::time::sleep(delay).await;
    }
}
