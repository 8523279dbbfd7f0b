//! Retry with capped full-jitter exponential backoff
//!
//! Recovers transient provider failures locally, up to a bounded budget.
//! Everything non-transient, and any fired cancellation, propagates
//! immediately and unchanged.

use std::future::Future;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{InvokeError, Result};

/// Decides whether a failed attempt may be re-run.
///
/// Provider adapters can override the default to match provider-specific
/// failure shapes. Classifiers hold no per-call state and are shared across
/// concurrent calls.
pub trait ErrorClassifier: Send + Sync {
    fn retryable(&self, error: &InvokeError) -> bool;
}

/// Default classification: network failures and HTTP 408/429/5xx are
/// retryable, everything else is fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn retryable(&self, error: &InvokeError) -> bool {
        match error {
            InvokeError::Network(_) => true,
            InvokeError::Http { status, .. } => {
                matches!(status, 408 | 429) || (500..=599).contains(status)
            }
            _ => false,
        }
    }
}

/// Run `attempt` until it succeeds, fails fatally, or the budget runs out.
///
/// The first attempt counts as attempt 1. After a failure the cancellation
/// signal is checked first: once fired, the call fails as
/// [`InvokeError::Aborted`] without consuming any retry budget. A
/// non-retryable error, or a retryable one on the final attempt, is returned
/// unchanged. Backoff waits race the cancellation signal.
///
/// Holds no cross-call state; one config can drive any number of concurrent
/// calls.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    classifier: &dyn ErrorClassifier,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt_number = 1usize;
    loop {
        match attempt().await {
            Ok(value) => {
                if attempt_number > 1 {
                    debug!(attempts = attempt_number, "attempt succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) => {
                if cancel.is_cancelled() || error.is_abort() {
                    return Err(InvokeError::Aborted);
                }
                if !classifier.retryable(&error) {
                    debug!(%error, "non-retryable error");
                    return Err(error);
                }
                if attempt_number >= max_attempts {
                    warn!(
                        attempts = attempt_number,
                        %error,
                        "retry budget exhausted"
                    );
                    return Err(error);
                }
                let delay = config.delay_for_attempt(attempt_number);
                warn!(
                    attempt = attempt_number,
                    %error,
                    ?delay,
                    "attempt failed; backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(InvokeError::Aborted),
                    _ = sleep(delay) => {}
                }
                attempt_number += 1;
            }
        }
    }
}
