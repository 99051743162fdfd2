//! Error types for building and running a batch engine.

use bufio_core::StorageError;

/// Invalid construction arguments. The engine is never created.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("a worker is required to build a batch engine")]
    MissingWorker,
    #[error("batch size must be a positive integer, got {value}")]
    InvalidBatchSize { value: i64 },
    #[error("flush interval must be greater than zero")]
    InvalidFlushInterval,
}

/// A worker failed to process a batch.
///
/// Absorbed by the flush cycle and handed to the engine's failure handler
/// together with the batch; it never reaches `push` callers or the timer.
#[derive(Debug, thiserror::Error)]
#[error("worker failed to process batch of {records} record(s): {source}")]
pub struct WorkerError {
    /// Number of records in the failed batch.
    pub records: usize,
    /// The error the worker returned.
    pub source: anyhow::Error,
}

/// Errors surfaced by engine lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no Tokio runtime available to drive the flush timer")]
    NoRuntime,
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
