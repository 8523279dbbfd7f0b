//! # modelcall
//!
//! A resilient, cancellable, observable invocation engine for generative-AI
//! network services (chat, embedding, image, speech, transcription), in both
//! single-shot and streaming modes.
//!
//! The crate is deliberately provider-agnostic: building request bodies,
//! validating response shapes, and authentication belong to provider
//! adapters, which hand the engine an *attempt* — an operation taking only a
//! cancellation signal. The engine turns that attempt into a reliable call:
//!
//! - **Retry**: capped full-jitter exponential backoff over classified
//!   transient failures ([`retry`])
//! - **Throttling**: FIFO-fair admission control bounding in-flight attempts
//!   per provider ([`throttle`])
//! - **Streaming**: an SSE decode pipeline feeding an ordered async queue
//!   ([`sse`], [`queue`]), with best-effort structured-output previews
//!   ([`partial_json`])
//! - **Observability**: exactly one started and one finished lifecycle event
//!   per logical call ([`events`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use modelcall::{CallExecutor, CallOptions, InvokeError, RetryConfig};
//!
//! # async fn example() -> Result<(), InvokeError> {
//! // Composition root: one executor per provider/credential.
//! let executor = CallExecutor::builder()
//!     .retry(RetryConfig::default())
//!     .max_concurrent(5)
//!     .build();
//!
//! let completion: String = executor
//!     .invoke(CallOptions::new().function_id("generate-text"), |cancel| async move {
//!         // A provider adapter performs the network call here, observing
//!         // `cancel` and translating failures into InvokeError.
//!         # let _ = cancel;
//!         Ok("hello".to_string())
//!     })
//!     .await?;
//! # let _ = completion;
//! # Ok(())
//! # }
//! ```
//!
//! Streaming calls return an [`queue::AsyncQueue`] of reducer snapshots; see
//! [`CallExecutor::invoke_stream`].

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod partial_json;
pub mod queue;
pub mod retry;
pub mod sse;
pub mod throttle;

pub use config::{RetryConfig, ThrottleConfig};
pub use error::{InvokeError, Result};
pub use events::{observer_fn, CallEvent, CallMetadata, CallObserver, ObserverSet, TracingObserver};
pub use executor::{CallExecutor, CallExecutorBuilder, CallOptions};
pub use partial_json::parse_partial;
pub use queue::{AsyncQueue, QueueReader};
pub use retry::{retry_with_backoff, DefaultClassifier, ErrorClassifier};
pub use sse::{
    decode_sse, ByteStream, ChatChoiceReducer, ChatDelta, ChatDeltaChoice, ChatDeltaFrame,
    ChoiceState, DeltaEvent, DeltaReducer, JsonPreviewReducer, SseFramer, DONE_SENTINEL,
};
pub use throttle::{ConcurrencyThrottle, ThrottleTicket};
