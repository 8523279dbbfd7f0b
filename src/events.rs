//! Lifecycle events for observability
//!
//! Every logical call emits exactly one `Started` event and exactly one
//! `Finished*` event, carrying immutable per-call metadata. Observers are
//! plain synchronous callbacks registered at the composition root (on the
//! executor) or per call; there is no process-global observer state.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::InvokeError;

/// Immutable metadata describing one logical call.
#[derive(Debug, Clone)]
pub struct CallMetadata {
    /// Fresh per call, never reused
    pub call_id: String,
    /// Set for nested calls, e.g. a tool invocation inside an orchestration
    pub parent_call_id: Option<String>,
    /// Caller-assigned label for grouping related calls
    pub function_id: Option<String>,
    pub start_timestamp: DateTime<Utc>,
    /// Present on finished events only
    pub duration_ms: Option<u64>,
}

impl CallMetadata {
    pub fn new(parent_call_id: Option<String>, function_id: Option<String>) -> Self {
        Self {
            call_id: format!("call-{}", Uuid::new_v4()),
            parent_call_id,
            function_id,
            start_timestamp: Utc::now(),
            duration_ms: None,
        }
    }

    pub fn finished(&self, duration_ms: u64) -> Self {
        Self {
            duration_ms: Some(duration_ms),
            ..self.clone()
        }
    }
}

/// A started/finished notification describing one logical call's progress.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Started {
        metadata: CallMetadata,
    },
    FinishedSuccess {
        metadata: CallMetadata,
        value: Value,
    },
    FinishedError {
        metadata: CallMetadata,
        error: InvokeError,
    },
    FinishedAbort {
        metadata: CallMetadata,
    },
}

impl CallEvent {
    pub fn metadata(&self) -> &CallMetadata {
        match self {
            CallEvent::Started { metadata }
            | CallEvent::FinishedSuccess { metadata, .. }
            | CallEvent::FinishedError { metadata, .. }
            | CallEvent::FinishedAbort { metadata } => metadata,
        }
    }
}

/// Synchronous observer of lifecycle events.
pub trait CallObserver: Send + Sync {
    fn on_event(&self, event: &CallEvent);
}

/// Wrap a closure as a [`CallObserver`].
pub fn observer_fn<F>(f: F) -> Arc<dyn CallObserver>
where
    F: Fn(&CallEvent) + Send + Sync + 'static,
{
    struct FnObserver<F>(F);
    impl<F> CallObserver for FnObserver<F>
    where
        F: Fn(&CallEvent) + Send + Sync,
    {
        fn on_event(&self, event: &CallEvent) {
            (self.0)(event)
        }
    }
    Arc::new(FnObserver(f))
}

/// Ordered set of observers for one call.
///
/// Observers run synchronously in registration order. A panicking observer
/// is contained: the panic is logged and the remaining observers still run,
/// so observation can never change a call's outcome.
#[derive(Clone)]
pub struct ObserverSet {
    observers: Arc<Vec<Arc<dyn CallObserver>>>,
}

impl ObserverSet {
    pub fn new(observers: Vec<Arc<dyn CallObserver>>) -> Self {
        Self {
            observers: Arc::new(observers),
        }
    }

    pub fn notify(&self, event: &CallEvent) {
        for observer in self.observers.iter() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer.on_event(event))) {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                warn!(
                    call_id = %event.metadata().call_id,
                    panic = %reason,
                    "call observer panicked while handling event"
                );
            }
        }
    }
}

/// Observer that logs every lifecycle event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl CallObserver for TracingObserver {
    fn on_event(&self, event: &CallEvent) {
        let metadata = event.metadata();
        let call_id = metadata.call_id.as_str();
        let function_id = metadata.function_id.as_deref().unwrap_or("-");
        match event {
            CallEvent::Started { .. } => {
                info!(call_id, function_id, "call started");
            }
            CallEvent::FinishedSuccess { .. } => {
                info!(
                    call_id,
                    function_id,
                    duration_ms = metadata.duration_ms,
                    "call finished"
                );
            }
            CallEvent::FinishedError { error, .. } => {
                error!(
                    call_id,
                    function_id,
                    duration_ms = metadata.duration_ms,
                    %error,
                    "call failed"
                );
            }
            CallEvent::FinishedAbort { .. } => {
                info!(
                    call_id,
                    function_id,
                    duration_ms = metadata.duration_ms,
                    "call aborted"
                );
            }
        }
    }
}
