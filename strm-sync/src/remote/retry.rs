//! Fixed-delay retry executor for remote calls.
//!
//! Every call gets at most `max_retries` attempts in total. A failed attempt
//! waits `retry_delay` before the next one, and every successful call waits
//! `req_delay` before returning so the remote endpoint sees a steady cadence.
//! Errors that are not transient (bad paths, configuration) are returned on
//! the first attempt.

use std::future::Future;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::Result;
use crate::config::{AppSettings, PacingSettings, SettingsSubscriber};

/// Retry executor shared by every remote call site.
pub struct RetryExecutor {
    policy: RwLock<PacingSettings>,
}

impl RetryExecutor {
    pub fn new(policy: PacingSettings) -> Self {
        Self {
            policy: RwLock::new(policy),
        }
    }

    /// Policy applied to calls started from now on.
    pub fn policy(&self) -> PacingSettings {
        *self.policy.read()
    }

    pub fn set_policy(&self, policy: PacingSettings) {
        *self.policy.write() = policy;
    }

    /// Run `op` under the current policy.
    ///
    /// The policy is read once per call, so a settings change never alters a
    /// call that is already in progress.
    pub async fn execute<T, F, Fut>(&self, description: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.policy();
        let max_attempts = policy.max_retries.max(1);
        let mut attempt = 1u32;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "{} succeeded after retry", description);
                    }
                    if policy.req_delay_ms > 0 {
                        sleep(Duration::from_millis(policy.req_delay_ms)).await;
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    warn!(
                        attempts = attempt,
                        error = %err,
                        "{} failed, retries exhausted", description
                    );
                    return Err(err);
                }
                Err(err) => {
                    debug!(
                        attempt,
                        max_attempts,
                        error = %err,
                        "{} failed, retrying in {}ms", description, policy.retry_delay_ms
                    );
                    if policy.retry_delay_ms > 0 {
                        sleep(Duration::from_millis(policy.retry_delay_ms)).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl SettingsSubscriber for RetryExecutor {
    fn name(&self) -> &'static str {
        "retry-executor"
    }

    fn apply_settings(&self, settings: &AppSettings) {
        self.set_policy(settings.pacing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn executor(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(PacingSettings {
            max_retries,
            retry_delay_ms: 0,
            req_delay_ms: 0,
        })
    }

    /// Fails `failures` times, then succeeds.
    async fn flaky(executor: &RetryExecutor, failures: u32) -> (Result<u32>, u32) {
        let calls = AtomicU32::new(0);
        let result = executor
            .execute("flaky call", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= failures {
                        Err(Error::Other(format!("failure {n}")))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_success_on_last_allowed_attempt() {
        let (result, calls) = flaky(&executor(3), 2).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_exhausted_after_max_retries_failures() {
        let (result, calls) = flaky(&executor(3), 3).await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = executor(5)
            .execute("bad path", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::InvalidRemotePath("a\nb".to_string())) }
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidRemotePath(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delays_are_applied() {
        let executor = RetryExecutor::new(PacingSettings {
            max_retries: 2,
            retry_delay_ms: 30,
            req_delay_ms: 20,
        });
        let start = Instant::now();
        let (result, _) = flaky(&executor, 1).await;
        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_hot_reload_applies_to_next_call() {
        let executor = executor(1);
        let (result, _) = flaky(&executor, 1).await;
        assert!(result.is_err());

        executor.set_policy(PacingSettings {
            max_retries: 2,
            retry_delay_ms: 0,
            req_delay_ms: 0,
        });
        let (result, calls) = flaky(&executor, 1).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 2);
    }
}
