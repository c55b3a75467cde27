//! Exponential backoff for transient store failures.
//!
//! Only errors reporting [`StoreError::is_retryable`] are retried; anything
//! else (including `LockNotHeld`) is returned on the first occurrence.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::statestore::StoreError;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "millis", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    #[serde(with = "millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first one
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::cycle()
    }
}

impl RetryConfig {
    /// Connecting to the store at startup: a handful of attempts, then give up
    #[must_use]
    pub fn startup() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_attempts: 5,
        }
    }

    /// Store calls inside a matchmaking cycle; short, the deadline is tight
    #[must_use]
    pub fn cycle() -> Self {
        Self {
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
            max_attempts: 4,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
            max_attempts: 3,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, runs out of attempts or is cancelled
pub async fn retry<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !err.is_retryable() || attempts >= config.max_attempts.max(1) {
                    return Err(err);
                }

                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, config.max_attempts, err, delay
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(StoreError::Canceled),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = config.next_delay(delay);
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_after_unavailable() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = retry("get_ticket", &RetryConfig::test(), &CancellationToken::new(), || {
            let a = counter.clone();
            async move {
                if a.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::StoreUnavailable("connection reset".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> =
            retry("update_backfill", &RetryConfig::test(), &CancellationToken::new(), || {
                let a = counter.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::LockNotHeld("backfill:b1".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(StoreError::LockNotHeld(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), _> = retry("lock", &RetryConfig::test(), &CancellationToken::new(), || {
            let a = counter.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::LockTimeout("backfill:b1".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::LockTimeout(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = RetryConfig {
            initial_delay: Duration::from_secs(60),
            ..RetryConfig::test()
        };

        let result: Result<(), _> = retry("query", &config, &cancel, || async {
            Err(StoreError::StoreUnavailable("down".to_string()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::Canceled)));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            factor: 2.0,
            max_attempts: 5,
        };

        let second = config.next_delay(config.initial_delay);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(config.next_delay(second), Duration::from_millis(300));
    }
}
