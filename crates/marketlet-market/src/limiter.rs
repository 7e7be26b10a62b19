//! Token bucket shared by every marketplace call.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{MarketError, Result};

/// Requests-per-minute limiter with a bounded wait.
///
/// Callers take one token per request. When the bucket is empty a caller
/// sleeps until the next token is due, unless that is further away than
/// `max_wait`, in which case it fails with [`MarketError::RateLimited`]
/// without consuming anything.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    per_second: f64,
    max_wait: Duration,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Create a limiter allowing `requests_per_minute` with bursts up to `burst`.
    #[must_use]
    pub fn new(requests_per_minute: u32, burst: u32, max_wait: Duration) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            per_second: f64::from(requests_per_minute.max(1)) / 60.0,
            max_wait,
            state: Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Wait for a token.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::RateLimited`] if no token would become available
    /// within the configured maximum wait.
    pub async fn acquire(&self) -> Result<()> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            let wait = {
                let mut bucket = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.capacity);
                bucket.refilled_at = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.per_second)
            };

            if Instant::now() + wait > deadline {
                debug!(wait_ms = wait.as_millis(), "rate limit wait exceeds budget");
                return Err(MarketError::RateLimited);
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available, rounded down.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn available(&self) -> u32 {
        let bucket = self.state.lock();
        let elapsed = Instant::now()
            .duration_since(bucket.refilled_at)
            .as_secs_f64();
        let tokens = (bucket.tokens + elapsed * self.per_second).min(self.capacity);
        tokens.floor() as u32
    }
}
