//! Bounded exponential-backoff retry for broker operations.
//!
//! This is a connection-level policy: it smooths over transient broker
//! outages. It never retries validation errors and knows nothing about the
//! notification being published.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Retry strategy: `attempts` total tries, waiting `delay` before the second
/// one and multiplying the wait by `backoff` after each further failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub backoff: u32,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration, backoff: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            backoff: backoff.max(1),
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1)
    }

    /// Wait before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.delay
            .saturating_mul(self.backoff.saturating_pow(retry))
    }

    /// Run `op` until it succeeds, returns a non-dependency error, or the
    /// attempts are exhausted. The last error is returned.
    pub async fn run<T, F, Fut>(&self, op_name: &'static str, op: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.run_until(op_name, &CancellationToken::new(), op).await
    }

    /// Like [`run`](Self::run), but stops waiting for the next attempt once
    /// `cancel` fires and returns the last error.
    pub async fn run_until<T, F, Fut>(
        &self,
        op_name: &'static str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_dependency_failure() || attempt >= self.attempts {
                        return Err(err);
                    }

                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(
                        operation = op_name,
                        attempt,
                        max_attempts = self.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Broker operation failed, retrying"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::warn!(operation = op_name, "Retry abandoned on shutdown");
                            return Err(err);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts, 3 s initial delay, doubling.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(3), 2)
    }
}
