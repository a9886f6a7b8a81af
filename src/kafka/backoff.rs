//! Retry backoff policy
//!
//! Shared by the connection manager (reconnects) and the producer (batch
//! retries) so both follow the same attempt budget and delay curve.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::error::{KafkaError, Result};

/// Exponential backoff with a cap and a bounded number of retries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Retries allowed after the first attempt.
    max_retries: u32,
    /// Delay before the first retry.
    base_delay: Duration,
    /// Coefficient the delay is multiplied by for every past retry.
    multiplier: u32,
    /// Upper bound for any single delay.
    max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, multiplier: u32, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier: multiplier.max(1),
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(retry)
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Run `op` until it succeeds, fails with a non-retriable error, or the
    /// budget is spent. The last error is returned unchanged.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match op(retries).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && self.should_retry(retries) => {
                    let delay = self.delay(retries);
                    debug!(
                        "{} failed (retry {}/{}), backing off {:?}: {}",
                        what,
                        retries + 1,
                        self.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        use super::constants::{
            DEFAULT_RETRIES, DEFAULT_RETRY_BACKOFF_MAX_MS, DEFAULT_RETRY_BACKOFF_MS,
            DEFAULT_RETRY_BACKOFF_MULTIPLIER,
        };
        Self::new(
            DEFAULT_RETRIES as u32,
            Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS as u64),
            DEFAULT_RETRY_BACKOFF_MULTIPLIER,
            Duration::from_millis(DEFAULT_RETRY_BACKOFF_MAX_MS as u64),
        )
    }
}

/// Wrap the final error of an exhausted reconnect loop as fatal.
pub fn exhausted(what: &str, attempts: u32, last: KafkaError) -> KafkaError {
    match last {
        KafkaError::Transport(msg) | KafkaError::Connect(msg) => KafkaError::Connect(format!(
            "{} unreachable after {} attempt(s): {}",
            what, attempts, msg
        )),
        KafkaError::Io(e) => KafkaError::Connect(format!(
            "{} unreachable after {} attempt(s): {}",
            what, attempts, e
        )),
        other => other,
    }
}
