//! Retry Policy
//!
//! Bounded retry with randomized exponential backoff, shared by the write
//! guard and by gateway lookups.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Retry configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Randomize each delay into `[d/2, d]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Read `RECONCILE_MAX_ATTEMPTS` and `RECONCILE_BASE_DELAY_MS`, falling
    /// back to the defaults for anything unset or unparseable
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_attempts = std::env::var("RECONCILE_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &u32| *n > 0)
            .unwrap_or(defaults.max_attempts);
        let base_delay = std::env::var("RECONCILE_BASE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map_or(defaults.base_delay, Duration::from_millis);

        Self {
            max_attempts,
            base_delay,
            ..defaults
        }
    }

    /// Single attempt, no waiting
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter {
            return delay;
        }

        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis < 2 {
            return delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts
    pub async fn retry<T, E, F, Fut>(
        &self,
        mut operation: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if attempt < self.max_attempts && is_retryable(&error) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        error = %error,
                        ?delay,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
