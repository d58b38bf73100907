//! Concurrency Guard
//!
//! Serializes writers that share an external id. Each unit of work runs
//! under an exclusive per-key lock, builds a [`Transaction`] and commits it
//! in one step. Lock contention and unique-constraint races are retried with
//! backoff; the retry re-reads and sees the winning row.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::retry::RetryPolicy;
use crate::store::{BillingStore, Transaction};

/// Keyed exclusive lock over a billing store
pub struct ConcurrencyGuard {
    store: Arc<dyn BillingStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    policy: RetryPolicy,
    lock_timeout: Duration,
}

impl ConcurrencyGuard {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            policy: RetryPolicy::default(),
            lock_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn store(&self) -> &dyn BillingStore {
        self.store.as_ref()
    }

    /// Run `work` under the lock for `key` and commit what it wrote
    ///
    /// `work` may run more than once and must build its writes from the
    /// transaction's reads each time.
    pub async fn with_exclusive_lock<T, F>(&self, key: &str, mut work: F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(key, &mut work).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    tracing::debug!(key, attempt, error = %error, ?delay, "Retrying guarded write");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    if error.is_retryable() {
                        tracing::warn!(
                            key,
                            attempts = attempt,
                            error = %error,
                            "Guarded write exhausted retries"
                        );
                    }
                    return Err(error);
                }
            }
        }
    }

    async fn attempt<T, F>(&self, key: &str, work: &mut F) -> Result<T>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T>,
    {
        let lock = self.lock_for(key);
        let held = tokio::time::timeout(self.lock_timeout, Arc::clone(&lock).lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout(key.to_string()))?;

        let mut tx = Transaction::new(self.store.as_ref());
        let result = match work(&mut tx) {
            Ok(value) if tx.is_empty() => Ok(value),
            Ok(value) => self.store.commit(tx.into_changes()).map(|()| value),
            Err(error) => Err(error),
        };

        drop(held);
        drop(lock);
        self.locks.remove_if(key, |_, entry| Arc::strong_count(entry) == 1);
        result
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Keys with a live lock entry
    pub fn held_keys(&self) -> usize {
        self.locks.len()
    }
}
