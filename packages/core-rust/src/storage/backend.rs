//! The storage contract.

use crate::error::StorageError;

/// Batch size used when an engine is built without an explicit one.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// FIFO queue of records awaiting processing.
///
/// All operations are synchronous and take `&self`; implementations provide
/// their own interior locking so a single instance can be shared as
/// `Arc<dyn Storage<T>>` between the engine, its scheduler task, and
/// producers.
///
/// Invariants every backend must uphold:
/// - `enqueue` never drops a record it accepted.
/// - `dequeue_batch` removes exactly the records it returns, in one atomic
///   step. A record is never returned twice and never lost between calls.
pub trait Storage<T>: Send + Sync + 'static {
    /// Append a record at the tail of the queue.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the backend cannot persist the record.
    fn enqueue(&self, record: T) -> Result<(), StorageError>;

    /// Remove and return up to `max_count` records from the head of the queue.
    ///
    /// Returns an empty vector when the queue is empty or `max_count` is 0;
    /// in the latter case the queue is left untouched.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the backend cannot read or rewrite its
    /// contents. On error no record is removed.
    fn dequeue_batch(&self, max_count: usize) -> Result<Vec<T>, StorageError>;

    /// Number of records currently pending.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the backend cannot be read.
    fn len(&self) -> Result<usize, StorageError>;

    /// Whether no records are pending.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the backend cannot be read.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Batch size the engine falls back to when none is configured.
    fn default_batch_size(&self) -> usize {
        DEFAULT_BATCH_SIZE
    }
}
