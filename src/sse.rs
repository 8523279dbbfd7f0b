//! Server-Sent Events delta decoding
//!
//! What this module provides
//! - `SseFramer`: an incremental framing state machine that turns raw byte
//!   chunks into complete `data:` payloads
//! - `decode_sse`: spawns a producer task that parses each payload as JSON,
//!   folds it through a caller-supplied [`DeltaReducer`], and pushes one
//!   [`DeltaEvent`] per frame into an [`AsyncQueue`]
//! - `ChatChoiceReducer`: a built-in reducer for chat-style frames that
//!   tracks per-choice content/role increments
//!
//! Implementation strategy
//! - Framing is line-based: chunks accumulate in a byte buffer, lines split
//!   on `\n` (trailing `\r` stripped), a blank line dispatches the record.
//!   Multi-line `data:` fields join with `\n`; comments and non-`data`
//!   fields are ignored. Splitting at line granularity means a chunk
//!   boundary can never fall inside a UTF-8 sequence we decode.
//! - The producer task never waits on consumers: the queue is unbounded, so
//!   decoding speed is independent of read speed
//! - Fail fast on a malformed payload: once framing is suspect, ordering can
//!   no longer be trusted, so one error event is pushed and the queue closes
//!
//! Testing strategy
//! - Scripted byte streams split at awkward boundaries (mid-line, mid-record)
//! - The accumulation sequence `"Hel"` then `"Hello"` from two chat frames
//! - Malformed JSON, cancellation, and transport-error terminations

use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{InvokeError, Result};
use crate::queue::AsyncQueue;

/// A cooperative, cancellable source of sequential byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Terminal sentinel payload used by OpenAI-style streaming endpoints.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Unit produced by the decoder: one snapshot per frame, or a terminal
/// decode error.
#[derive(Debug, Clone)]
pub enum DeltaEvent<T> {
    Delta(T),
    Error(InvokeError),
}

/// Provider-specific fold of one SSE frame into running accumulator state.
///
/// The reducer owns the accumulator; `apply` merges one decoded frame and
/// returns the snapshot to emit for it. A frame that parsed as JSON but is
/// semantically hostile (e.g. an absurd choice index) is rejected with an
/// error, which ends the stream the same way malformed JSON does.
pub trait DeltaReducer: Send + 'static {
    type Frame: DeserializeOwned + Send;
    type Snapshot: Clone + Send + Sync + 'static;

    fn apply(&mut self, frame: Self::Frame) -> Result<Self::Snapshot>;
}

/// Incremental SSE framing state machine.
///
/// Feed it byte chunks as they arrive; it yields the `data` payload of each
/// completed record.
#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk, returning the payloads of all records it
    /// completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(payload) = self.process_line(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush a record left unterminated at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let line: Vec<u8> = std::mem::take(&mut self.buffer);
            let line = match line.strip_suffix(b"\r") {
                Some(stripped) => stripped.to_vec(),
                None => line,
            };
            if let Some(payload) = self.process_line(&line) {
                return Some(payload);
            }
        }
        if self.data_lines.is_empty() {
            None
        } else {
            Some(self.take_record())
        }
    }

    fn process_line(&mut self, line: &[u8]) -> Option<String> {
        if line.is_empty() {
            // Blank line: dispatch the pending record, if any.
            if self.data_lines.is_empty() {
                return None;
            }
            return Some(self.take_record());
        }
        if line[0] == b':' {
            // Comment / keep-alive.
            return None;
        }
        let line = String::from_utf8_lossy(line);
        let (field, rest) = match line.split_once(':') {
            Some((field, rest)) => (field, rest),
            None => (line.as_ref(), ""),
        };
        if field == "data" {
            self.data_lines
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // event:/id:/retry: and unknown fields carry nothing we decode.
        None
    }

    fn take_record(&mut self) -> String {
        let record = self.data_lines.join("\n");
        self.data_lines.clear();
        record
    }
}

/// Decode an SSE byte stream into a queue of [`DeltaEvent`]s.
///
/// A producer task reads the stream until it ends, the terminal sentinel
/// arrives, an error occurs, or the cancellation signal fires:
/// - sentinel payload: the queue closes cleanly and reading stops
/// - malformed JSON payload: one `DeltaEvent::Error` is pushed and the
///   queue closes immediately
/// - transport error: surfaced the same way, as `DeltaEvent::Error`
/// - fired cancellation: the queue closes with a queue-level
///   [`InvokeError::Aborted`] marker, not a generic error
pub fn decode_sse<R>(
    mut stream: ByteStream,
    mut reducer: R,
    cancel: CancellationToken,
    done_sentinel: &str,
) -> AsyncQueue<DeltaEvent<R::Snapshot>>
where
    R: DeltaReducer,
{
    let queue = AsyncQueue::new();
    let producer = queue.clone();
    let sentinel = done_sentinel.to_string();

    tokio::spawn(async move {
        let mut framer = SseFramer::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = producer.error(InvokeError::Aborted);
                    return;
                }
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for payload in framer.feed(&bytes) {
                        if !handle_payload(&producer, &mut reducer, &sentinel, &payload) {
                            return;
                        }
                    }
                }
                Some(Err(error)) => {
                    let _ = producer.push(DeltaEvent::Error(error));
                    producer.close();
                    return;
                }
                None => {
                    if let Some(payload) = framer.finish() {
                        if !handle_payload(&producer, &mut reducer, &sentinel, &payload) {
                            return;
                        }
                    }
                    debug!("byte stream ended without terminal sentinel");
                    producer.close();
                    return;
                }
            }
        }
    });

    queue
}

/// Returns `false` once decoding must stop.
fn handle_payload<R>(
    queue: &AsyncQueue<DeltaEvent<R::Snapshot>>,
    reducer: &mut R,
    sentinel: &str,
    payload: &str,
) -> bool
where
    R: DeltaReducer,
{
    if payload == sentinel {
        queue.close();
        return false;
    }
    let frame = match serde_json::from_str::<R::Frame>(payload) {
        Ok(frame) => frame,
        Err(error) => {
            let _ = queue.push(DeltaEvent::Error(error.into()));
            queue.close();
            return false;
        }
    };
    match reducer.apply(frame) {
        Ok(snapshot) => queue.push(DeltaEvent::Delta(snapshot)).is_ok(),
        Err(error) => {
            let _ = queue.push(DeltaEvent::Error(error));
            queue.close();
            false
        }
    }
}

// ===== Built-in chat-style reducer =====

/// One frame of a chat-style streaming response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatDeltaFrame {
    pub choices: Vec<ChatDeltaChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatDeltaChoice {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub delta: ChatDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Accumulated state of one parallel choice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChoiceState {
    pub role: Option<String>,
    pub content: String,
    pub is_complete: bool,
}

/// Upper bound on a frame's `index` field. Real providers run a handful of
/// parallel choices; anything past this is a hostile or corrupt frame, and
/// trusting it would size the accumulator from attacker-controlled input.
pub const MAX_CHOICE_INDEX: usize = 1024;

/// Reducer folding chat frames into per-index [`ChoiceState`]s.
///
/// Content increments append, roles stick once seen, and a finish signal
/// marks the choice complete. Each snapshot is a deep copy of the running
/// state, so consumers can hold on to any of them.
#[derive(Debug, Default)]
pub struct ChatChoiceReducer {
    choices: Vec<ChoiceState>,
}

impl ChatChoiceReducer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeltaReducer for ChatChoiceReducer {
    type Frame = ChatDeltaFrame;
    type Snapshot = Vec<ChoiceState>;

    fn apply(&mut self, frame: ChatDeltaFrame) -> Result<Vec<ChoiceState>> {
        for choice in frame.choices {
            if choice.index > MAX_CHOICE_INDEX {
                return Err(InvokeError::Parse(format!(
                    "choice index {} exceeds the supported maximum of {MAX_CHOICE_INDEX}",
                    choice.index
                )));
            }
            if self.choices.len() <= choice.index {
                self.choices
                    .resize_with(choice.index + 1, ChoiceState::default);
            }
            let state = &mut self.choices[choice.index];
            if let Some(content) = choice.delta.content {
                state.content.push_str(&content);
            }
            if let Some(role) = choice.delta.role {
                state.role = Some(role);
            }
            if choice.finish_reason.is_some() {
                state.is_complete = true;
            }
        }
        Ok(self.choices.clone())
    }
}

/// Reducer producing best-effort structured previews while JSON output
/// streams in.
///
/// Accumulates the first choice's content text and runs it through
/// [`parse_partial`](crate::partial_json::parse_partial) on every frame.
/// The snapshot is `None` until enough of the document has arrived to
/// recover a value.
#[derive(Debug, Default)]
pub struct JsonPreviewReducer {
    inner: ChatChoiceReducer,
}

impl JsonPreviewReducer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeltaReducer for JsonPreviewReducer {
    type Frame = ChatDeltaFrame;
    type Snapshot = Option<serde_json::Value>;

    fn apply(&mut self, frame: ChatDeltaFrame) -> Result<Option<serde_json::Value>> {
        let choices = self.inner.apply(frame)?;
        Ok(choices
            .first()
            .and_then(|choice| crate::partial_json::parse_partial(&choice.content)))
    }
}
