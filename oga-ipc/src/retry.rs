//! Bounded connect-retry policy.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How many times to try, and how long to wait between tries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `0` behaves like `1`.
    pub attempts: u32,
    /// Pause between two consecutive attempts.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff_ms: 2000,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts,
            backoff_ms: backoff.as_millis() as u64,
        }
    }

    /// Exactly one attempt.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Run `op` until it succeeds or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Returns the first success
    /// or the error of the last attempt. There is no pause after the final
    /// failure.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!("attempt {attempt}/{attempts} failed: {e}");
                    tokio::time::sleep(self.backoff()).await;
                    attempt += 1;
                }
            }
        }
    }
}
