//! Bounded exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::ProviderError;

/// How provider calls are retried on transient errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first call included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Builds the policy from the declaration's provider section.
    #[must_use]
    pub const fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based) after `error`.
    ///
    /// A `retry_after` hint from the provider replaces the computed
    /// backoff; either way the delay never exceeds `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32, error: &ProviderError) -> Duration {
        let delay = error.retry_after_secs().map_or_else(
            || {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                self.initial_delay.saturating_mul(factor)
            },
            Duration::from_secs,
        );
        delay.min(self.max_delay)
    }

    /// Runs `call` until it succeeds, fails terminally or runs out of attempts.
    ///
    /// Returns the last result and the number of attempts made.
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> (Result<T, ProviderError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match call().await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt, &e);
                    warn!("{what} failed (attempt {attempt}/{max_attempts}), retrying in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!("{what} gave up after {attempt} attempt(s): {e}");
                    return (Err(e), attempt);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn unavailable() -> ProviderError {
        ProviderError::Unavailable {
            status: 503,
            message: String::from("busy"),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };

        assert_eq!(policy.delay_for(1, &unavailable()), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, &unavailable()), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, &unavailable()), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4, &unavailable()), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_after_hint_is_capped() {
        let policy = RetryPolicy::default();
        let limited = ProviderError::RateLimited { retry_after_secs: 2 };
        assert_eq!(policy.delay_for(1, &limited), Duration::from_secs(2));

        let long = ProviderError::RateLimited { retry_after_secs: 600 };
        assert_eq!(policy.delay_for(1, &long), policy.max_delay);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);

        let (result, attempts) = quick()
            .run("create", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let (result, attempts): (Result<(), _>, _) = quick()
            .run("create", || async {
                Err(ProviderError::Rejected {
                    status: 400,
                    message: String::from("bad"),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let (result, attempts): (Result<(), _>, _) =
            quick().run("create", || async { Err(unavailable()) }).await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts, 3);
    }
}
