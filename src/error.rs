//! Error types for the invocation engine

use thiserror::Error;

/// Result type alias for the invocation engine
pub type Result<T> = std::result::Result<T, InvokeError>;

/// Main error type for the invocation engine.
///
/// Every variant is `Clone` so that a terminal error marker stored in an
/// [`AsyncQueue`](crate::queue::AsyncQueue) can be observed by any number of
/// independent consumers. Adapters translate provider failures into
/// `Network`/`Http` before returning; the engine itself never invents a
/// provider error.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// Connection-level failure (DNS, reset, broken pipe)
    #[error("network failure: {0}")]
    Network(String),

    /// Non-success HTTP response translated by the provider adapter
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Provider returned a well-formed but invalid response
    #[error("response validation failed: {0}")]
    Validation(String),

    /// Malformed payload inside a stream
    #[error("parse error: {0}")]
    Parse(String),

    /// The shared cancellation signal fired
    #[error("operation aborted")]
    Aborted,

    /// Push after close, a collaborator programming error
    #[error("cannot push to closed queue")]
    QueueClosed,

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for InvokeError {
    fn from(err: serde_json::Error) -> Self {
        InvokeError::Parse(err.to_string())
    }
}

impl InvokeError {
    /// True for the `Aborted` variant. Used wherever cancellation must win
    /// over whatever error the attempt itself produced.
    pub fn is_abort(&self) -> bool {
        matches!(self, InvokeError::Aborted)
    }
}
