//! Retry policy with exponential backoff and a generic async attempt helper.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Maximum backoff between attempts regardless of multiplier.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry policy for fallible async operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1).
    pub max_attempts: u32,
    /// Sleep after the first failure.
    pub base_delay: Duration,
    /// Growth factor applied after each further failure.
    pub multiplier: u32,
    /// Upper bound on any single sleep.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` tries, sleeping `base`, `2*base`, `4*base`, ...
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: 2,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self::exponential(1, Duration::ZERO)
    }

    /// Sleep after the `failures`-th failure (1-based). Zero for 0.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.saturating_pow(failures - 1);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 1s then 2s.
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1))
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted.
///
/// `op` receives the 1-based attempt number. Returns the last error on
/// exhaustion. No sleep follows the final attempt.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_if(policy, label, |_| true, op).await
}

/// Like [`retry`], but an error for which `retryable` returns `false` is
/// returned at once without sleeping.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts => return Err(e),
            Err(e) if !retryable(&e) => {
                warn!(label, attempt, error = %e, "permanent failure, not retrying");
                return Err(e);
            }
            Err(e) => {
                let backoff = policy.delay_for(attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
