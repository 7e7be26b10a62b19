//! Bounded exponential backoff for transient marketplace failures.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{MarketError, Result};

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(8))
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    #[must_use]
    pub const fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Maximum number of retries after the first attempt.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `operation`, retrying errors for which [`MarketError::is_retriable`] holds.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// non-retriable error.
    pub async fn execute<F, Fut, T>(&self, op: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_if(op, MarketError::is_retriable, operation)
            .await
    }

    /// Run `operation`, retrying only errors accepted by `should_retry`.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first error
    /// rejected by `should_retry`.
    pub async fn execute_if<P, F, Fut, T>(
        &self,
        op: &str,
        should_retry: P,
        mut operation: F,
    ) -> Result<T>
    where
        P: Fn(&MarketError) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if should_retry(&e) && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        op,
                        error = %e,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis(),
                        "retrying marketplace call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if should_retry(&e) {
                        warn!(op, error = %e, "marketplace retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = policy
            .execute("test", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MarketError::Unavailable("503".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(100));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = policy
            .execute("test", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MarketError::RateLimited)
            })
            .await;

        assert!(matches!(result, Err(MarketError::RateLimited)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = policy
            .execute("test", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MarketError::Unauthorized)
            })
            .await;

        assert!(matches!(result, Err(MarketError::Unauthorized)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_narrows_retries() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = policy
            .execute_if(
                "create",
                |e| matches!(e, MarketError::RateLimited),
                || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(MarketError::Unavailable("timeout".to_string()))
                },
            )
            .await;

        assert!(matches!(result, Err(MarketError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
