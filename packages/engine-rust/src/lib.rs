//! Bufio engine: buffers records and flushes them to a worker in bounded
//! batches on a fixed interval.
//!
//! Storage backends and the [`Worker`] trait live in `bufio-core` and are
//! re-exported here.

pub mod config;
pub mod engine;
pub mod error;
pub mod failure;
pub mod metrics;
pub mod producer;
pub mod scheduler;
pub mod telemetry;

pub use bufio_core::{
    FileStorage, MemoryStorage, Storage, StorageError, Worker, DEFAULT_BATCH_SIZE,
};
pub use config::{EngineConfig, DEFAULT_ENGINE_NAME, DEFAULT_FLUSH_INTERVAL};
pub use engine::{BatchEngine, BatchEngineBuilder, DrainSummary, EngineState, FlushOutcome};
pub use error::{ConfigurationError, EngineError, WorkerError};
pub use failure::{
    CompositeFailureHandler, DeadLetterHandler, FailureHandler, LoggingFailureHandler,
};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use producer::simulate_producer;
