//! Concurrency admission control
//!
//! Bounds the number of simultaneous in-flight attempts per throttle
//! instance. Callers typically create one instance per provider/credential
//! so parallelism is bounded independently. Waiters are admitted strictly
//! FIFO (the fairness guarantee of `tokio::sync::Semaphore`).
//!
//! The throttle wraps each individual retry attempt, never the whole retry
//! loop: a backoff wait must not hold a slot, so a slow or failing call
//! cannot starve the concurrency budget.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::ThrottleConfig;
use crate::error::{InvokeError, Result};

/// Clonable handle to one shared concurrency budget.
#[derive(Debug, Clone)]
pub struct ConcurrencyThrottle {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

/// One reserved concurrency slot.
///
/// Released exactly once, on drop, regardless of how the holding scope
/// exits.
#[derive(Debug)]
pub struct ThrottleTicket {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyThrottle {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(config.max_concurrent)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Reserve a slot, waiting FIFO behind earlier callers if the limit is
    /// reached. A fired cancellation signal rejects the wait with
    /// [`InvokeError::Aborted`].
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<ThrottleTicket> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InvokeError::Aborted),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                // The semaphore is never closed by this type.
                let permit = permit
                    .map_err(|_| InvokeError::Other("throttle semaphore closed".to_string()))?;
                Ok(ThrottleTicket { _permit: permit })
            }
        }
    }

    /// Run one attempt inside a reserved slot, releasing it on every exit
    /// path.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, attempt: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _ticket = self.acquire(cancel).await?;
        attempt().await
    }
}
