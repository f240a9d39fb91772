//! Fixed-delay retry policy shared by every provider call site.
//!
//! The policy is a plain value: pipelines hold a copy and wrap each outbound
//! request with [`RetryPolicy::run`]. Cancellation is checked before every
//! attempt and before every delay, and a cancelled run never counts against
//! the attempt ceiling.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::gateway::{ChatGateway, ChatRequest, ChatResponse, ProviderError};

/// Returns true once the caller has raised the cancel flag.
pub fn is_cancelled(cancel_flag: Option<&AtomicBool>) -> bool {
    cancel_flag.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, the
    /// attempt ceiling is reached, or the cancel flag is raised.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        cancel_flag: Option<&AtomicBool>,
        mut op: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if is_cancelled(cancel_flag) {
                return Err(ProviderError::Cancelled);
            }
            attempt += 1;
            debug!(attempt, max_attempts, "provider attempt");

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if matches!(err, ProviderError::Cancelled) {
                return Err(err);
            }
            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }

            warn!(
                attempt,
                max_attempts,
                code = err.code(),
                error = %err,
                "provider call failed; retrying"
            );

            if is_cancelled(cancel_flag) {
                return Err(ProviderError::Cancelled);
            }
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
        }
    }

    /// Send one chat request through `gateway` under this policy.
    pub async fn chat(
        &self,
        gateway: &dyn ChatGateway,
        req: &ChatRequest,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<ChatResponse, ProviderError> {
        self.run(cancel_flag, |_| gateway.chat(req.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO)
    }

    #[tokio::test]
    async fn retries_retryable_errors_up_to_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(3)
            .run(None, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::EmptyResponse { provider: "test" })
            })
            .await;

        assert!(matches!(result, Err(ProviderError::EmptyResponse { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(5)
            .run(None, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::invalid_request("bad schema"))
            })
            .await;

        assert!(matches!(result, Err(ProviderError::InvalidRequest { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let result = fast(3)
            .run(None, |attempt| async move {
                if attempt == 1 {
                    Err(ProviderError::provider("test", "503", true))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt_makes_no_calls() {
        let calls = AtomicU32::new(0);
        let flag = AtomicBool::new(true);
        let result: Result<(), _> = fast(3)
            .run(Some(&flag), |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_observed_before_backoff() {
        let flag = AtomicBool::new(false);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(5)
            .run(Some(&flag), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                flag.store(true, Ordering::SeqCst);
                async { Err(ProviderError::provider("test", "overloaded", true)) }
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_attempts.max(1), 1);
        assert_eq!(RetryPolicy::once().max_attempts, 1);
    }
}
