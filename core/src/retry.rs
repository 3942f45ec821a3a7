//! [`RetryHandler`] and [`BackoffPolicy`]: the delay/attempt policy for
//! operations that are not themselves `TaskQueue` items, e.g. a strategy's
//! internal LLM call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{ClassifiedError, ErrorClass};

/// Computes the delay before retry attempt `attempt` (1-indexed).
#[async_trait]
pub trait BackoffPolicy: Send + Sync {
    async fn delay_for(&self, attempt: u32) -> Duration;
}

/// Always waits the same duration.
pub struct ConstantBackoff(pub Duration);

#[async_trait]
impl BackoffPolicy for ConstantBackoff {
    async fn delay_for(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// `base * factor^(attempt-1)`, capped at `max`.
pub struct ExponentialBackoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, factor: f64) -> Self {
        Self { base, factor, max: None }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }
}

#[async_trait]
impl BackoffPolicy for ExponentialBackoff {
    async fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.base.as_secs_f64() * self.factor.powi(exponent);
        let mut delay = Duration::from_secs_f64(scaled.max(0.0));
        if let Some(max) = self.max {
            delay = delay.min(max);
        }
        delay
    }
}

/// Wraps another policy and scales its delay by a random factor in
/// `[1.0, 1.0 + jitter)`.
pub struct JitterBackoff<B: BackoffPolicy> {
    pub inner: B,
    pub jitter: f64,
}

impl<B: BackoffPolicy> JitterBackoff<B> {
    pub fn new(inner: B, jitter: f64) -> Self {
        Self { inner, jitter }
    }
}

#[async_trait]
impl<B: BackoffPolicy> BackoffPolicy for JitterBackoff<B> {
    async fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.inner.delay_for(attempt).await;
        let factor = 1.0 + fastrand::f64() * self.jitter;
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }
}

/// The outcome of [`RetryHandler::execute_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ClassifiedError>,
    pub attempts: u32,
}

/// Centralizes the attempt/delay policy for ad-hoc fallible operations.
/// `max_attempts` bounds the loop regardless of class; per-class overrides
/// are expressed by swapping in a different `BackoffPolicy`.
pub struct RetryHandler {
    pub backoff: Arc<dyn BackoffPolicy>,
    pub max_attempts: u32,
}

impl RetryHandler {
    pub fn new(backoff: Arc<dyn BackoffPolicy>, max_attempts: u32) -> Self {
        Self { backoff, max_attempts }
    }

    /// Fatal classes never retry; otherwise retry while attempts remain.
    pub fn should_retry(&self, class: ErrorClass, attempts: u32) -> bool {
        !class.is_fatal() && attempts < self.max_attempts
    }

    /// Invokes `attempt_fn(attempt_number, previous_errors)` until it
    /// succeeds or attempts are exhausted, sleeping [`Self::should_retry`]'s
    /// computed delay between attempts.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut attempt_fn: F) -> RetryOutcome<T>
    where
        F: FnMut(u32, &[ClassifiedError]) -> Fut,
        Fut: std::future::Future<Output = Result<T, ClassifiedError>>,
    {
        let mut previous_errors = Vec::new();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match attempt_fn(attempt, &previous_errors).await {
                Ok(data) => {
                    return RetryOutcome {
                        success: true,
                        data: Some(data),
                        error: None,
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    let class = err.class();
                    previous_errors.push(err.clone());
                    if !self.should_retry(class, attempt) {
                        return RetryOutcome {
                            success: false,
                            data: None,
                            error: Some(err),
                            attempts: attempt,
                        };
                    }
                    let delay = self.backoff.delay_for(attempt).await;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Lets strategies amend a prompt with accumulated error context before
    /// the next retry.
    pub fn generate_error_feedback(errors: &[ClassifiedError], prior_prompt: &str) -> String {
        if errors.is_empty() {
            return prior_prompt.to_string();
        }
        let mut feedback = String::from(prior_prompt);
        feedback.push_str("\n\nPrevious attempts failed with:\n");
        for (i, err) in errors.iter().enumerate() {
            feedback.push_str(&format!("{}. {}\n", i + 1, err.message));
        }
        feedback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn exponential_backoff_grows_by_factor() {
        let policy = ExponentialBackoff::new(Duration::from_millis(100), 2.0);
        assert_eq!(policy.delay_for(1).await, Duration::from_millis(100));
        assert_eq!(policy.delay_for(2).await, Duration::from_millis(200));
        assert_eq!(policy.delay_for(3).await, Duration::from_millis(400));
    }

    #[tokio::test]
    async fn exponential_backoff_respects_max() {
        let policy = ExponentialBackoff::new(Duration::from_millis(100), 10.0).with_max(Duration::from_millis(500));
        assert_eq!(policy.delay_for(5).await, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retry_handler_stops_after_max_attempts() {
        let handler = RetryHandler::new(Arc::new(ConstantBackoff(Duration::from_millis(1))), 3);
        let calls = AtomicU32::new(0);
        let outcome = handler
            .execute_with_retry(|_attempt, _prev| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ClassifiedError::new("boom")) }
            })
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_handler_never_retries_fatal_classes() {
        let handler = RetryHandler::new(Arc::new(ConstantBackoff(Duration::from_millis(1))), 5);
        let outcome = handler
            .execute_with_retry(|_attempt, _prev| async { Err::<(), _>(ClassifiedError::new("auth_error: denied")) })
            .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn retry_handler_returns_success_without_exhausting_attempts() {
        let handler = RetryHandler::new(Arc::new(ConstantBackoff(Duration::from_millis(1))), 5);
        let calls = AtomicU32::new(0);
        let outcome = handler
            .execute_with_retry(|attempt, _prev| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ClassifiedError::new("network unreachable"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
    }
}
