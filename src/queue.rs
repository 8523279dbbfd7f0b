//! Ordered async queue with explicit close/error termination
//!
//! What this module provides
//! - `AsyncQueue<T>`: a multi-producer, multi-consumer sequence where every
//!   consumer owns an independent read cursor over the same entries
//! - Explicit termination: `close()` ends the sequence cleanly, `error()`
//!   ends it with a terminal error marker that each consumer observes once
//!
//! Implementation strategy
//! - Entries are appended to a shared `Vec` and never removed, so any number
//!   of readers can replay the sequence from the start; backlog is unbounded
//!   and producers are never blocked by slow consumers
//! - Waiting readers park on a `tokio::sync::Notify`; every push/close wakes
//!   all of them (`notify_waiters`), and each re-checks its own cursor
//!
//! Testing strategy
//! - Scripted push sequences asserting exact delivery order and terminal
//!   behavior, including consumers that start waiting before the push

use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::Notify;

use crate::error::{InvokeError, Result};

#[derive(Debug, Clone)]
enum QueueEntry<T> {
    Value(T),
    Error(InvokeError),
}

#[derive(Debug)]
struct QueueState<T> {
    entries: Vec<QueueEntry<T>>,
    closed: bool,
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

/// An ordered, async-iterable queue.
///
/// Cloning the queue clones the handle, not the contents: all clones push
/// into the same sequence. Values must be `Clone` because several readers
/// may observe the same entry.
#[derive(Debug)]
pub struct AsyncQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> AsyncQueue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    entries: Vec::new(),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Append a value to the tail, waking all waiting readers.
    ///
    /// Fails with [`InvokeError::QueueClosed`] once the queue is closed.
    pub fn push(&self, value: T) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("queue lock poisoned");
            if state.closed {
                return Err(InvokeError::QueueClosed);
            }
            state.entries.push(QueueEntry::Value(value));
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Append a terminal error marker and close the queue.
    ///
    /// Each reader that reaches the marker observes the error exactly once
    /// and then completes. Fails with [`InvokeError::QueueClosed`] if the
    /// queue was already closed.
    pub fn error(&self, error: InvokeError) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("queue lock poisoned");
            if state.closed {
                return Err(InvokeError::QueueClosed);
            }
            state.entries.push(QueueEntry::Error(error));
            state.closed = true;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Close the queue, forbidding further pushes. Idempotent.
    ///
    /// Readers drain whatever is still buffered before completing.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock().expect("queue lock poisoned");
            state.closed = true;
        }
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().expect("queue lock poisoned").closed
    }

    /// Create an independent reader starting at the head of the sequence.
    pub fn reader(&self) -> QueueReader<T> {
        QueueReader {
            shared: Arc::clone(&self.shared),
            position: 0,
            done: false,
        }
    }
}

/// An independent cursor over one [`AsyncQueue`].
#[derive(Debug)]
pub struct QueueReader<T> {
    shared: Arc<Shared<T>>,
    position: usize,
    done: bool,
}

impl<T: Clone> QueueReader<T> {
    /// Next entry in push order.
    ///
    /// Returns `Some(Ok(value))` for values, `Some(Err(_))` once for a
    /// terminal error marker (ending this reader), and `None` when the queue
    /// is closed and this reader has drained every buffered entry. Waits
    /// while nothing is buffered past the cursor and the queue is open.
    pub async fn next(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        loop {
            // The Notified future must exist before the state check so a
            // push between unlock and await still wakes this reader.
            let notified = self.shared.notify.notified();
            {
                let state = self.shared.state.lock().expect("queue lock poisoned");
                if self.position < state.entries.len() {
                    let entry = state.entries[self.position].clone();
                    self.position += 1;
                    match entry {
                        QueueEntry::Value(value) => return Some(Ok(value)),
                        QueueEntry::Error(error) => {
                            self.done = true;
                            return Some(Err(error));
                        }
                    }
                }
                if state.closed {
                    self.done = true;
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Adapt this reader into a `futures::Stream` of `Result<T>`.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send
    where
        T: Send + Sync + 'static,
    {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next().await.map(|item| (item, reader))
        })
    }
}
