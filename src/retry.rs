//! Retry policy for external tool failures
//!
//! ## Table of Contents
//! - **RetryConfig**: Attempt count and backoff
//! - **RetryPolicy**: Runs a unit, cleaning up and retrying retryable failures
//!
//! Only [`crate::error::PublishError::is_retryable`] failures are retried. Every other
//! error is returned immediately.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Delay multiplier per retry
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum retries
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set initial delay
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    fn delay(&self, attempt: u32) -> Duration {
        let ms = self.initial_delay.as_millis() as f64 * self.multiplier.max(1.0).powi(attempt as i32);
        Duration::from_millis(ms as u64)
    }
}

/// Runs units of work with cleanup-then-retry on external failures
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self::new(RetryConfig::new().max_retries(0))
    }

    /// Run `operation`, calling `cleanup` before each retry
    pub fn run<T>(
        &self,
        mut operation: impl FnMut() -> Result<T>,
        mut cleanup: impl FnMut(),
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.delay(attempt);
                    attempt += 1;
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after cleanup");
                    cleanup();
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Async variant of [`RetryPolicy::run`] without cleanup
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.delay(attempt);
                    attempt += 1;
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying request");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use std::cell::Cell;

    fn quick() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::new().initial_delay(Duration::from_millis(1)))
    }

    #[test]
    fn test_retries_external_once_after_cleanup() {
        let calls = Cell::new(0);
        let cleanups = Cell::new(0);
        let result = quick().run(
            || {
                calls.set(calls.get() + 1);
                if calls.get() == 1 {
                    Err(PublishError::external("exporter crashed"))
                } else {
                    Ok(calls.get())
                }
            },
            || cleanups.set(cleanups.get() + 1),
        );
        assert_eq!(result.unwrap(), 2);
        assert_eq!(cleanups.get(), 1);
    }

    #[test]
    fn test_gives_up_after_one_retry() {
        let calls = Cell::new(0);
        let result: Result<()> = quick().run(
            || {
                calls.set(calls.get() + 1);
                Err(PublishError::external("still broken"))
            },
            || {},
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_composition_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = quick().run(
            || {
                calls.set(calls.get() + 1);
                Err(PublishError::composition("layer gone"))
            },
            || {},
        );
        assert!(matches!(result, Err(PublishError::Composition(_))));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_async_retry() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result = quick()
            .execute(|| {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(PublishError::external("503"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }
}
