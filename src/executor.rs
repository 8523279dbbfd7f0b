//! Call orchestration: resilience, cancellation, lifecycle events
//!
//! What this module provides
//! - `CallExecutor`: turns one logical model call into a reliable,
//!   cancellable, observable operation, independent of the provider behind
//!   it
//! - `invoke` for single-shot calls, `invoke_stream` for SSE streaming
//!
//! Implementation strategy
//! - Each individual retry attempt runs inside a throttle slot; the slot is
//!   released before any backoff wait so a failing call cannot starve the
//!   concurrency budget
//! - Exactly one `Started` event precedes the first attempt and exactly one
//!   `Finished*` event follows final resolution; for a stream, "final
//!   resolution" is the decode loop closing, so the recorded duration spans
//!   the whole transfer
//! - A fired cancellation signal always resolves as `FinishedAbort` +
//!   `Aborted`, even when the attempt's own error arrives first

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{RetryConfig, ThrottleConfig};
use crate::error::{InvokeError, Result};
use crate::events::{CallEvent, CallMetadata, CallObserver, ObserverSet};
use crate::queue::AsyncQueue;
use crate::retry::{retry_with_backoff, DefaultClassifier, ErrorClassifier};
use crate::sse::{decode_sse, ByteStream, DeltaEvent, DeltaReducer, DONE_SENTINEL};
use crate::throttle::ConcurrencyThrottle;

/// Per-call options: identity for nesting, the shared cancellation signal,
/// and any call-scoped observers.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub parent_call_id: Option<String>,
    pub function_id: Option<String>,
    pub cancel: CancellationToken,
    pub observers: Vec<Arc<dyn CallObserver>>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parent_call_id(mut self, id: impl Into<String>) -> Self {
        self.parent_call_id = Some(id.into());
        self
    }

    pub fn function_id(mut self, id: impl Into<String>) -> Self {
        self.function_id = Some(id.into());
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

/// The invocation engine's orchestrator.
///
/// Immutable once built; share one instance (it is cheap to clone) across
/// all calls to a provider so they compete for the same concurrency budget.
/// Construct it at the composition root via [`CallExecutor::builder`].
#[derive(Clone)]
pub struct CallExecutor {
    retry: RetryConfig,
    throttle: ConcurrencyThrottle,
    classifier: Arc<dyn ErrorClassifier>,
    observers: Vec<Arc<dyn CallObserver>>,
}

/// Builder for [`CallExecutor`].
pub struct CallExecutorBuilder {
    retry: RetryConfig,
    throttle: Option<ConcurrencyThrottle>,
    classifier: Arc<dyn ErrorClassifier>,
    observers: Vec<Arc<dyn CallObserver>>,
}

impl CallExecutorBuilder {
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.throttle = Some(ConcurrencyThrottle::new(max_concurrent));
        self
    }

    /// Share an existing throttle, e.g. one per provider credential.
    pub fn throttle(mut self, throttle: ConcurrencyThrottle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> CallExecutor {
        CallExecutor {
            retry: self.retry,
            throttle: self
                .throttle
                .unwrap_or_else(|| ConcurrencyThrottle::from_config(&ThrottleConfig::default())),
            classifier: self.classifier,
            observers: self.observers,
        }
    }
}

impl Default for CallExecutor {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CallExecutor {
    pub fn builder() -> CallExecutorBuilder {
        CallExecutorBuilder {
            retry: RetryConfig::default(),
            throttle: None,
            classifier: Arc::new(DefaultClassifier),
            observers: Vec::new(),
        }
    }

    fn merged_observers(&self, options: &CallOptions) -> ObserverSet {
        let mut all = self.observers.clone();
        all.extend(options.observers.iter().cloned());
        ObserverSet::new(all)
    }

    /// Run one standard (non-streaming) call.
    ///
    /// `attempt` receives the shared cancellation signal and must translate
    /// a non-success provider response into a classifiable [`InvokeError`]
    /// before returning. It may be re-run up to the retry budget; each run
    /// holds one throttle slot for exactly its own duration.
    pub async fn invoke<T, F, Fut>(&self, options: CallOptions, attempt: F) -> Result<T>
    where
        T: Serialize,
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let observers = self.merged_observers(&options);
        let metadata = CallMetadata::new(options.parent_call_id, options.function_id);
        let cancel = options.cancel;
        observers.notify(&CallEvent::Started {
            metadata: metadata.clone(),
        });
        let started = Instant::now();

        let result = self.run_attempts(&cancel, &attempt).await;

        let finished = metadata.finished(started.elapsed().as_millis() as u64);
        match result {
            Ok(value) => {
                // The call itself succeeded; a value the event cannot carry
                // only degrades the event, never the outcome.
                let event_value = serde_json::to_value(&value).unwrap_or_else(|error| {
                    debug!(
                        call_id = %finished.call_id,
                        %error,
                        "success value is not serializable; event carries null"
                    );
                    Value::Null
                });
                observers.notify(&CallEvent::FinishedSuccess {
                    metadata: finished,
                    value: event_value,
                });
                Ok(value)
            }
            Err(error) => Err(Self::finish_failed(&observers, finished, &cancel, error)),
        }
    }

    /// Run one streaming call.
    ///
    /// `attempt` must resolve to the response byte stream; acquiring it runs
    /// under the same throttle+retry as a standard call. The stream is piped
    /// through the SSE decoder and the resulting snapshots are handed back
    /// as an [`AsyncQueue`]. The terminal lifecycle event fires when the
    /// decode loop ends, not at first byte; errors reach consumers at their
    /// point of iteration.
    pub async fn invoke_stream<R, F, Fut>(
        &self,
        options: CallOptions,
        reducer: R,
        attempt: F,
    ) -> Result<AsyncQueue<R::Snapshot>>
    where
        R: DeltaReducer,
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<ByteStream>>,
    {
        let observers = self.merged_observers(&options);
        let metadata = CallMetadata::new(options.parent_call_id, options.function_id);
        let cancel = options.cancel;
        observers.notify(&CallEvent::Started {
            metadata: metadata.clone(),
        });
        let started = Instant::now();

        let stream = match self.run_attempts(&cancel, &attempt).await {
            Ok(stream) => stream,
            Err(error) => {
                let finished = metadata.finished(started.elapsed().as_millis() as u64);
                return Err(Self::finish_failed(&observers, finished, &cancel, error));
            }
        };

        let deltas = decode_sse(stream, reducer, cancel.clone(), DONE_SENTINEL);
        let response: AsyncQueue<R::Snapshot> = AsyncQueue::new();
        let forward = response.clone();
        let mut reader = deltas.reader();
        tokio::spawn(async move {
            loop {
                match reader.next().await {
                    Some(Ok(DeltaEvent::Delta(snapshot))) => {
                        // The response queue only closes from this task, so
                        // a push can only fail if a consumer raced a close;
                        // nothing to do either way.
                        let _ = forward.push(snapshot);
                    }
                    Some(Ok(DeltaEvent::Error(error))) | Some(Err(error)) => {
                        let finished = metadata.finished(started.elapsed().as_millis() as u64);
                        if error.is_abort() {
                            observers.notify(&CallEvent::FinishedAbort { metadata: finished });
                        } else {
                            observers.notify(&CallEvent::FinishedError {
                                metadata: finished,
                                error: error.clone(),
                            });
                        }
                        let _ = forward.error(error);
                        return;
                    }
                    None => {
                        forward.close();
                        let finished = metadata.finished(started.elapsed().as_millis() as u64);
                        observers.notify(&CallEvent::FinishedSuccess {
                            metadata: finished,
                            value: Value::Null,
                        });
                        return;
                    }
                }
            }
        });

        Ok(response)
    }

    /// Retry loop with each attempt individually wrapped by the throttle.
    async fn run_attempts<T, F, Fut>(&self, cancel: &CancellationToken, attempt: &F) -> Result<T>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_backoff(&self.retry, self.classifier.as_ref(), cancel, || {
            let cancel = cancel.clone();
            async move {
                let _ticket = self.throttle.acquire(&cancel).await?;
                attempt(cancel.clone()).await
            }
        })
        .await
    }

    /// Terminal event + error mapping shared by both modes: a fired signal
    /// wins over whatever the attempt itself reported.
    fn finish_failed(
        observers: &ObserverSet,
        finished: CallMetadata,
        cancel: &CancellationToken,
        error: InvokeError,
    ) -> InvokeError {
        if cancel.is_cancelled() || error.is_abort() {
            observers.notify(&CallEvent::FinishedAbort { metadata: finished });
            InvokeError::Aborted
        } else {
            observers.notify(&CallEvent::FinishedError {
                metadata: finished,
                error: error.clone(),
            });
            error
        }
    }
}
