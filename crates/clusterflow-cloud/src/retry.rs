//! Bounded exponential backoff for eventually-consistent provider calls
//!
//! A just-created identity artifact or network is not immediately usable by
//! dependent calls. Instead of sleeping for a fixed time, callers poll the
//! dependent call itself and give up at a hard deadline.

use crate::error::{ApiError, ApiResult, CloudError, Result};
use crate::resource::ResourceKind;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Retry configuration for provider operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,

    /// Give up once this much time has passed since the first attempt
    pub deadline: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            deadline: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Repeat `call` while the provider answers `NotReady`.
///
/// Any other error is returned immediately. When the next delay would cross
/// the deadline the last provider error is returned as [`CloudError::Timeout`].
pub async fn retry_until<F, Fut, T>(
    config: &RetryConfig,
    kind: ResourceKind,
    name: &str,
    operation: &'static str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        match call().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(%kind, name, operation, attempt, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if e.is_not_ready() => {
                let delay = config.delay_for_attempt(attempt);
                let elapsed = started.elapsed();
                if elapsed + delay > config.deadline {
                    tracing::warn!(%kind, name, operation, attempt, error = %e, "giving up");
                    return Err(CloudError::Timeout {
                        kind,
                        name: name.to_string(),
                        operation,
                        elapsed,
                        source: e,
                    });
                }
                tracing::debug!(
                    %kind,
                    name,
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "dependency not ready, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(CloudError::api(kind, name, operation, e)),
        }
    }
}

/// Poll `probe` until it reports `true`, with the same backoff and deadline.
pub async fn wait_until<F, Fut>(
    config: &RetryConfig,
    kind: ResourceKind,
    name: &str,
    condition: &'static str,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<bool>>,
{
    retry_until(config, kind, name, condition, || {
        let fut = probe();
        async move {
            match fut.await? {
                true => Ok(()),
                false => Err(ApiError::not_ready(
                    "WaitPending",
                    format!("{} not reached yet", condition),
                )),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            deadline: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
            backoff_multiplier: 2.0,
            deadline: Duration::from_secs(60),
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(10000)); // capped at max
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_not_ready_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = retry_until(&fast(), ResourceKind::Instance, "c1-master-0", "run", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ApiError::not_ready("InvalidParameterValue", "profile"))
                } else {
                    Ok("i-1")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "i-1");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<()> =
            retry_until(&fast(), ResourceKind::Instance, "c1-master-0", "run", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::other("Unsupported", "nope"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Provider);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_produces_timeout() {
        let result: Result<()> =
            retry_until(&fast(), ResourceKind::Instance, "c1-worker-0", "run", || async {
                Err(ApiError::not_ready("InvalidParameterValue", "profile"))
            })
            .await;

        match result {
            Err(CloudError::Timeout { elapsed, .. }) => {
                assert!(elapsed <= Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_probe() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        wait_until(&fast(), ResourceKind::Network, "c1-vpc", "available", || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
