//! In-memory [`Storage`] implementation backed by a [`VecDeque`].
//!
//! The default backend for an engine. Fast and infallible, but its contents
//! are lost when the process exits.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::StorageError;
use crate::storage::backend::Storage;

/// Process-local FIFO queue guarded by a single mutex.
///
/// `dequeue_batch` drains its prefix under one lock acquisition, so it stays
/// atomic even when a timer-driven flush overlaps with a manual one or with
/// concurrent producers.
pub struct MemoryStorage<T> {
    queue: Mutex<VecDeque<T>>,
}

impl<T> MemoryStorage<T> {
    /// Creates a new, empty `MemoryStorage`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Creates an empty `MemoryStorage` with room for `capacity` records
    /// before reallocating.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }
}

impl<T> Default for MemoryStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Storage<T> for MemoryStorage<T> {
    fn enqueue(&self, record: T) -> Result<(), StorageError> {
        self.queue.lock().push_back(record);
        Ok(())
    }

    fn dequeue_batch(&self, max_count: usize) -> Result<Vec<T>, StorageError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let mut queue = self.queue.lock();
        let take = max_count.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self.queue.lock().len())
    }
}
