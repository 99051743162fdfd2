//! Failure handlers: what happens to a batch the worker could not process.
//!
//! Defines [`FailureHandler`], invoked once per failed batch with the worker
//! error and the batch itself, plus three ready-made handlers:
//!
//! - [`LoggingFailureHandler`]: logs and drops the batch
//! - [`DeadLetterHandler`]: moves the batch into a separate storage
//! - [`CompositeFailureHandler`]: fans out to several handlers
//!
//! The engine never re-enqueues a failed batch on its own; a handler is the
//! caller's only chance to recover it.

use std::sync::Arc;

use bufio_core::Storage;
use tracing::{error, warn};

use crate::error::WorkerError;

/// Receives batches whose processing failed.
///
/// Any `Fn(&WorkerError, Vec<T>)` closure is a handler. Used as
/// `Arc<dyn FailureHandler<T>>`.
pub trait FailureHandler<T>: Send + Sync + 'static {
    /// Called exactly once per failed batch. Takes ownership of the batch.
    fn on_failure(&self, error: &WorkerError, batch: Vec<T>);
}

impl<T, F> FailureHandler<T> for F
where
    F: Fn(&WorkerError, Vec<T>) + Send + Sync + 'static,
{
    fn on_failure(&self, error: &WorkerError, batch: Vec<T>) {
        self(error, batch);
    }
}

/// Logs each failed batch at `warn` and drops it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFailureHandler;

impl<T> FailureHandler<T> for LoggingFailureHandler {
    fn on_failure(&self, error: &WorkerError, batch: Vec<T>) {
        warn!(records = batch.len(), error = %error.source, "dropping failed batch");
    }
}

/// Moves failed batches into a dead-letter storage, preserving their order.
///
/// Dead-letter enqueue failures are logged, never propagated: the flush
/// cycle that invoked the handler has already finished with the batch.
pub struct DeadLetterHandler<T> {
    storage: Arc<dyn Storage<T>>,
}

impl<T> DeadLetterHandler<T> {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage<T>>) -> Self {
        Self { storage }
    }

    /// The storage holding dead-lettered records.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage<T>> {
        &self.storage
    }
}

impl<T: 'static> FailureHandler<T> for DeadLetterHandler<T> {
    fn on_failure(&self, error: &WorkerError, batch: Vec<T>) {
        let total = batch.len();
        let mut lost = 0usize;
        for record in batch {
            if let Err(e) = self.storage.enqueue(record) {
                lost += 1;
                error!(error = %e, "failed to dead-letter record");
            }
        }
        if lost == 0 {
            warn!(records = total, error = %error.source, "batch moved to dead-letter storage");
        } else {
            error!(records = total, lost, "dead-lettering lost records");
        }
    }
}

/// Fans a failed batch out to several handlers.
///
/// Every handler but the last receives a clone of the batch; the last one
/// receives the original.
pub struct CompositeFailureHandler<T> {
    handlers: Vec<Arc<dyn FailureHandler<T>>>,
}

impl<T> CompositeFailureHandler<T> {
    /// Creates a composite handler with the given list of handlers.
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn FailureHandler<T>>>) -> Self {
        Self { handlers }
    }

    /// Adds a handler after construction.
    pub fn add(&mut self, handler: Arc<dyn FailureHandler<T>>) {
        self.handlers.push(handler);
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<T> Default for CompositeFailureHandler<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<T> FailureHandler<T> for CompositeFailureHandler<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn on_failure(&self, error: &WorkerError, batch: Vec<T>) {
        let Some((last, rest)) = self.handlers.split_last() else {
            return;
        };
        for handler in rest {
            handler.on_failure(error, batch.clone());
        }
        last.on_failure(error, batch);
    }
}
