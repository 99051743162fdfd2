//! Timer-driven batch engine.
//!
//! [`BatchEngine`] owns a [`Storage`] and a [`Worker`]. Producers call
//! [`push`](BatchEngine::push); once [`start`](BatchEngine::start)ed, a
//! [`FlushScheduler`] runs one flush cycle per interval:
//!
//! 1. Acquire the re-entrancy guard (skip the cycle if another is running)
//! 2. Dequeue up to `batch_size` records
//! 3. Hand the batch to the worker
//! 4. Count the outcome; route failures to the [`FailureHandler`]
//!
//! Lifecycle: `Idle` (built or stopped) and `Running` (timer armed). There is
//! no terminal state.

use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bufio_core::{MemoryStorage, Storage, StorageError, Worker};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::error::{ConfigurationError, EngineError, WorkerError};
use crate::failure::FailureHandler;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::scheduler::{FlushScheduler, PeriodicTask};

/// Polling step used by [`BatchEngine::drain`] while another flush holds the
/// guard.
const DRAIN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Whether the flush timer is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built or stopped; records are accepted but nothing flushes on its own.
    Idle,
    /// The flush timer is armed.
    Running,
}

/// Result of a single flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush cycle was in progress; nothing was dequeued.
    Skipped,
    /// Storage was empty; the worker was not invoked.
    Empty,
    /// The worker processed the batch.
    Processed { records: usize },
    /// The worker failed; the batch went to the failure handler, if any.
    Failed { records: usize },
}

impl FlushOutcome {
    /// Number of records handed to the worker in this cycle.
    #[must_use]
    pub fn records(self) -> usize {
        match self {
            Self::Skipped | Self::Empty => 0,
            Self::Processed { records } | Self::Failed { records } => records,
        }
    }
}

/// Totals from a [`BatchEngine::drain`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Batches handed to the worker.
    pub batches: usize,
    /// Records handed to the worker.
    pub records: usize,
    /// Batches the worker failed on.
    pub failed_batches: usize,
}

// ---------------------------------------------------------------------------
// FlushGuard
// ---------------------------------------------------------------------------

/// RAII guard over the engine's in-progress flag.
///
/// Acquired with a compare-exchange so two cycles can never both proceed;
/// released on drop, including when the worker future panics or is dropped.
struct FlushGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlushGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// EngineCore
// ---------------------------------------------------------------------------

/// State shared between the engine handle and its scheduler task.
struct EngineCore<T, U> {
    /// Resolved configuration: the batch size is always set.
    config: EngineConfig,
    storage: Arc<dyn Storage<T>>,
    worker: Arc<dyn Worker<T, U>>,
    on_error: Option<Arc<dyn FailureHandler<T>>>,
    batch_size: NonZeroUsize,
    metrics: EngineMetrics,
    flushing: AtomicBool,
}

impl<T, U> EngineCore<T, U>
where
    T: Send + Sync + 'static,
    U: Send + 'static,
{
    async fn flush(&self) -> Result<FlushOutcome, StorageError> {
        let Some(_guard) = FlushGuard::try_acquire(&self.flushing) else {
            self.metrics.record_skipped();
            debug!(engine = %self.config.name, "flush already in progress, skipping cycle");
            return Ok(FlushOutcome::Skipped);
        };

        let batch = self.storage.dequeue_batch(self.batch_size.get())?;
        if batch.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let records = batch.len();
        self.metrics.record_flush();
        debug!(engine = %self.config.name, records, "dispatching batch to worker");

        let started = Instant::now();
        let result = AssertUnwindSafe(self.worker.process(&batch))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "worker panicked: {}",
                    panic_message(panic.as_ref())
                ))
            });
        let elapsed = started.elapsed();
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = elapsed.as_millis() as u64;

        match result {
            Ok(_) => {
                self.metrics.record_success(records, elapsed);
                info!(engine = %self.config.name, records, duration_ms, "flushed batch");
                Ok(FlushOutcome::Processed { records })
            }
            Err(source) => {
                self.metrics.record_failure(records, elapsed);
                let failure = WorkerError { records, source };
                error!(
                    engine = %self.config.name,
                    records,
                    duration_ms,
                    error = %failure.source,
                    "worker failed to process batch"
                );
                if let Some(handler) = &self.on_error {
                    let handled = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        handler.on_failure(&failure, batch);
                    }));
                    if let Err(panic) = handled {
                        error!(
                            engine = %self.config.name,
                            records,
                            panic = %panic_message(panic.as_ref()),
                            "failure handler panicked"
                        );
                    }
                }
                Ok(FlushOutcome::Failed { records })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[async_trait]
impl<T, U> PeriodicTask for EngineCore<T, U>
where
    T: Send + Sync + 'static,
    U: Send + 'static,
{
    async fn on_tick(&self) {
        // The timer keeps its schedule whatever the storage does.
        if let Err(e) = self.flush().await {
            error!(engine = %self.config.name, error = %e, "timer flush failed to read storage");
        }
    }
}

// ---------------------------------------------------------------------------
// BatchEngine
// ---------------------------------------------------------------------------

/// Buffers pushed records and flushes them to a worker in bounded batches.
///
/// All methods take `&self`, so an engine is typically shared as
/// `Arc<BatchEngine<T, U>>` between producers and the code that owns its
/// lifecycle. Dropping the engine cancels its timer.
pub struct BatchEngine<T, U> {
    core: Arc<EngineCore<T, U>>,
    scheduler: Mutex<Option<FlushScheduler>>,
}

impl<T, U> BatchEngine<T, U>
where
    T: Send + Sync + 'static,
    U: Send + 'static,
{
    /// Start configuring an engine.
    #[must_use]
    pub fn builder() -> BatchEngineBuilder<T, U> {
        BatchEngineBuilder::new()
    }

    /// Queue a record for the next flush cycles.
    ///
    /// `None` is discarded silently: nothing is queued or counted. Never
    /// waits on a flush in progress.
    ///
    /// # Errors
    ///
    /// Returns the storage backend's error if the record could not be
    /// enqueued.
    pub fn push(&self, record: impl Into<Option<T>>) -> Result<(), StorageError> {
        match record.into() {
            Some(record) => self.core.storage.enqueue(record),
            None => Ok(()),
        }
    }

    /// Arm the recurring flush timer. The first cycle runs one flush interval
    /// after this call.
    ///
    /// Calling `start` on a running engine is a no-op: at most one timer is
    /// ever armed per engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoRuntime`] when called outside a Tokio runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut slot = self.scheduler.lock();
        if slot.as_ref().is_some_and(|s| !s.is_finished()) {
            debug!(engine = %self.core.config.name, "flush timer already armed");
            return Ok(());
        }

        let scheduler =
            FlushScheduler::start(Arc::clone(&self.core), self.core.config.flush_interval)?;
        *slot = Some(scheduler);

        #[allow(clippy::cast_possible_truncation)]
        let interval_ms = self.core.config.flush_interval.as_millis() as u64;
        info!(
            engine = %self.core.config.name,
            interval_ms,
            batch_size = self.core.batch_size.get(),
            "flush timer armed"
        );
        Ok(())
    }

    /// Disarm the flush timer. Returns immediately and is safe to call on an
    /// idle engine.
    ///
    /// A flush cycle already in progress is neither interrupted nor awaited;
    /// only future cycles are prevented.
    pub fn stop(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.cancel();
            info!(engine = %self.core.config.name, "flush timer disarmed");
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        match self.scheduler.lock().as_ref() {
            Some(s) if !s.is_finished() => EngineState::Running,
            _ => EngineState::Idle,
        }
    }

    /// Run one flush cycle now, independent of the timer.
    ///
    /// # Errors
    ///
    /// Returns the storage backend's error if the batch could not be
    /// dequeued. Worker failures are never returned; they show up as
    /// [`FlushOutcome::Failed`].
    pub async fn flush(&self) -> Result<FlushOutcome, StorageError> {
        self.core.flush().await
    }

    /// Flush repeatedly until storage is empty.
    ///
    /// Waits out cycles held by the timer instead of skipping them. Records
    /// pushed while draining are drained too.
    ///
    /// # Errors
    ///
    /// Stops at the first storage error and returns it.
    pub async fn drain(&self) -> Result<DrainSummary, StorageError> {
        let mut summary = DrainSummary::default();
        loop {
            match self.core.flush().await? {
                FlushOutcome::Empty => break,
                FlushOutcome::Skipped => tokio::time::sleep(DRAIN_RETRY_DELAY).await,
                FlushOutcome::Processed { records } => {
                    summary.batches += 1;
                    summary.records += records;
                }
                FlushOutcome::Failed { records } => {
                    summary.batches += 1;
                    summary.records += records;
                    summary.failed_batches += 1;
                }
            }
        }
        debug!(
            engine = %self.core.config.name,
            batches = summary.batches,
            records = summary.records,
            "storage drained"
        );
        Ok(summary)
    }

    /// Disarm the timer, wait for its in-flight cycle to finish, then drain
    /// whatever is still pending.
    ///
    /// # Errors
    ///
    /// Returns the first storage error hit while draining.
    pub async fn shutdown(&self) -> Result<DrainSummary, StorageError> {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.stop_and_wait().await;
            info!(engine = %self.core.config.name, "flush timer stopped for shutdown");
        }
        self.drain().await
    }

    /// Copy of the engine's counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Records waiting in storage.
    ///
    /// # Errors
    ///
    /// Returns the storage backend's error if it cannot be read.
    pub fn pending(&self) -> Result<usize, StorageError> {
        self.core.storage.len()
    }

    /// The storage this engine drains.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage<T>> {
        &self.core.storage
    }

    /// The configuration the engine was built with, with the batch size
    /// resolved against the storage default.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.core.batch_size.get()
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        self.core.config.flush_interval
    }
}

// ---------------------------------------------------------------------------
// BatchEngineBuilder
// ---------------------------------------------------------------------------

/// Builder for [`BatchEngine`]. Validation happens in
/// [`build`](BatchEngineBuilder::build).
pub struct BatchEngineBuilder<T, U> {
    config: EngineConfig,
    storage: Option<Arc<dyn Storage<T>>>,
    worker: Option<Arc<dyn Worker<T, U>>>,
    on_error: Option<Arc<dyn FailureHandler<T>>>,
}

impl<T, U> BatchEngineBuilder<T, U>
where
    T: Send + Sync + 'static,
    U: Send + 'static,
{
    fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            storage: None,
            worker: None,
            on_error: None,
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Maximum records per batch. Must be positive.
    #[must_use]
    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.config.batch_size = Some(batch_size);
        self
    }

    #[must_use]
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.config.flush_interval = flush_interval;
        self
    }

    /// Storage backend. Defaults to a fresh [`MemoryStorage`] owned by this
    /// engine alone.
    #[must_use]
    pub fn storage<S: Storage<T>>(mut self, storage: S) -> Self {
        self.storage = Some(Arc::new(storage) as Arc<dyn Storage<T>>);
        self
    }

    /// The worker batches are handed to. Required.
    #[must_use]
    pub fn worker<W: Worker<T, U>>(mut self, worker: W) -> Self {
        self.worker = Some(Arc::new(worker) as Arc<dyn Worker<T, U>>);
        self
    }

    /// Handler for batches the worker fails on. Without one, failed batches
    /// are counted, logged, and dropped.
    #[must_use]
    pub fn on_error<H: FailureHandler<T>>(mut self, handler: H) -> Self {
        self.on_error = Some(Arc::new(handler) as Arc<dyn FailureHandler<T>>);
        self
    }

    /// Like [`on_error`](Self::on_error), for a handler shared elsewhere.
    #[must_use]
    pub fn on_error_shared(mut self, handler: Arc<dyn FailureHandler<T>>) -> Self {
        self.on_error = Some(handler);
        self
    }

    /// Validate the configuration and build an idle engine.
    ///
    /// # Errors
    ///
    /// - [`ConfigurationError::MissingWorker`] if no worker was supplied
    /// - [`ConfigurationError::InvalidBatchSize`] if the batch size is not
    ///   positive
    /// - [`ConfigurationError::InvalidFlushInterval`] if the interval is zero
    pub fn build(self) -> Result<BatchEngine<T, U>, ConfigurationError> {
        let worker = self.worker.ok_or(ConfigurationError::MissingWorker)?;
        let flush_interval = self.config.validate_flush_interval()?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::<T>::new()) as Arc<dyn Storage<T>>);
        let batch_size = self
            .config
            .resolve_batch_size(storage.default_batch_size())?;

        let config = EngineConfig {
            batch_size: Some(i64::try_from(batch_size.get()).unwrap_or(i64::MAX)),
            flush_interval,
            ..self.config
        };
        let core = EngineCore {
            metrics: EngineMetrics::new(config.name.clone()),
            config,
            storage,
            worker,
            on_error: self.on_error,
            batch_size,
            flushing: AtomicBool::new(false),
        };

        Ok(BatchEngine {
            core: Arc::new(core),
            scheduler: Mutex::new(None),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bufio_core::FileStorage;
    use proptest::prelude::*;
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::failure::DeadLetterHandler;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Job {
        id: u32,
    }

    fn jobs(ids: impl IntoIterator<Item = u32>) -> Vec<Job> {
        ids.into_iter().map(|id| Job { id }).collect()
    }

    /// Records every batch it sees; fails when `fail` is set.
    #[derive(Default)]
    struct RecordingWorker {
        batches: Mutex<Vec<Vec<Job>>>,
        fail: bool,
    }

    impl RecordingWorker {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Worker<Job, usize> for RecordingWorker {
        async fn process(&self, batch: &[Job]) -> anyhow::Result<usize> {
            self.batches.lock().push(batch.to_vec());
            if self.fail {
                anyhow::bail!("worker failed");
            }
            Ok(batch.len())
        }
    }

    /// Blocks inside `process` until the gate is opened.
    struct GatedWorker {
        entered: Notify,
        gate: Semaphore,
    }

    impl GatedWorker {
        fn new() -> Self {
            Self {
                entered: Notify::new(),
                gate: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl Worker<Job, ()> for GatedWorker {
        async fn process(&self, _batch: &[Job]) -> anyhow::Result<()> {
            self.entered.notify_one();
            let _permit = self.gate.acquire().await?;
            Ok(())
        }
    }

    /// Storage whose every operation fails, counting dequeue attempts.
    #[derive(Default)]
    struct BrokenStorage {
        dequeues: Arc<AtomicUsize>,
    }

    impl Storage<Job> for BrokenStorage {
        fn enqueue(&self, _record: Job) -> Result<(), StorageError> {
            Err(anyhow::anyhow!("disk full").into())
        }

        fn dequeue_batch(&self, _max_count: usize) -> Result<Vec<Job>, StorageError> {
            self.dequeues.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("disk unreadable").into())
        }

        fn len(&self) -> Result<usize, StorageError> {
            Ok(0)
        }
    }

    fn engine_with(
        worker: Arc<RecordingWorker>,
        batch_size: i64,
    ) -> BatchEngine<Job, usize> {
        BatchEngine::builder()
            .worker(worker)
            .batch_size(batch_size)
            .flush_interval(Duration::from_secs(1))
            .build()
            .unwrap()
    }

    // --- construction ---

    #[test]
    fn build_without_worker_fails() {
        let result = BatchEngine::<Job, usize>::builder().build();
        assert!(matches!(result, Err(ConfigurationError::MissingWorker)));
    }

    #[test]
    fn non_positive_batch_size_fails() {
        for value in [0, -1] {
            let result = BatchEngine::<Job, usize>::builder()
                .worker(RecordingWorker::default())
                .batch_size(value)
                .build();
            assert!(matches!(
                result,
                Err(ConfigurationError::InvalidBatchSize { value: v }) if v == value
            ));
        }
    }

    #[test]
    fn zero_flush_interval_fails() {
        let result = BatchEngine::<Job, usize>::builder()
            .worker(RecordingWorker::default())
            .flush_interval(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(ConfigurationError::InvalidFlushInterval)));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let engine = BatchEngine::<Job, usize>::builder()
            .worker(RecordingWorker::default())
            .build()
            .unwrap();

        assert_eq!(engine.name(), "bufio");
        assert_eq!(engine.batch_size(), bufio_core::DEFAULT_BATCH_SIZE);
        assert_eq!(engine.flush_interval(), Duration::from_millis(5_000));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.pending().unwrap(), 0);
        // The resolved batch size is reported even when none was configured.
        assert_eq!(engine.config().batch_size, Some(100));
    }

    #[test]
    fn each_engine_gets_its_own_default_storage() {
        let a = engine_with(Arc::new(RecordingWorker::default()), 10);
        let b = engine_with(Arc::new(RecordingWorker::default()), 10);

        a.push(Job { id: 1 }).unwrap();

        assert_eq!(a.pending().unwrap(), 1);
        assert_eq!(b.pending().unwrap(), 0);
    }

    #[test]
    fn config_struct_is_honored() {
        let engine = BatchEngine::<Job, usize>::builder()
            .worker(RecordingWorker::default())
            .config(EngineConfig {
                name: "orders".to_string(),
                batch_size: Some(7),
                flush_interval: Duration::from_millis(250),
            })
            .build()
            .unwrap();

        assert_eq!(engine.name(), "orders");
        assert_eq!(engine.batch_size(), 7);
        assert_eq!(engine.flush_interval(), Duration::from_millis(250));
        assert_eq!(engine.config().batch_size, Some(7));
    }

    // --- push / flush ---

    #[tokio::test]
    async fn flush_takes_batches_in_push_order() {
        let worker = Arc::new(RecordingWorker::default());
        let engine = engine_with(Arc::clone(&worker), 2);

        for id in 1..=3 {
            engine.push(Job { id }).unwrap();
        }

        assert_eq!(
            engine.flush().await.unwrap(),
            FlushOutcome::Processed { records: 2 }
        );
        assert_eq!(*worker.batches.lock(), vec![jobs([1, 2])]);
        assert_eq!(engine.pending().unwrap(), 1);

        assert_eq!(
            engine.flush().await.unwrap(),
            FlushOutcome::Processed { records: 1 }
        );
        assert_eq!(*worker.batches.lock(), vec![jobs([1, 2]), jobs([3])]);

        let metrics = engine.metrics();
        assert_eq!(metrics.flush_count, 2);
        assert_eq!(metrics.success_count, 2);
        assert_eq!(metrics.records_processed, 3);
    }

    #[tokio::test]
    async fn flush_on_empty_storage_has_no_effect() {
        let worker = Arc::new(RecordingWorker::default());
        let engine = engine_with(Arc::clone(&worker), 2);

        assert_eq!(engine.flush().await.unwrap(), FlushOutcome::Empty);
        assert_eq!(engine.flush().await.unwrap(), FlushOutcome::Empty);

        assert!(worker.batches.lock().is_empty());
        assert_eq!(engine.metrics(), MetricsSnapshot::default());
    }

    #[tokio::test]
    async fn push_none_is_discarded() {
        let worker = Arc::new(RecordingWorker::default());
        let engine = engine_with(Arc::clone(&worker), 2);

        engine.push(Job { id: 1 }).unwrap();
        engine.push(None::<Job>).unwrap();

        assert_eq!(engine.pending().unwrap(), 1);
        engine.flush().await.unwrap();
        assert_eq!(*worker.batches.lock(), vec![jobs([1])]);
    }

    #[tokio::test]
    async fn worker_failure_routes_batch_to_handler_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let engine = BatchEngine::<Job, usize>::builder()
            .worker(RecordingWorker::failing())
            .batch_size(5)
            .on_error(move |err: &WorkerError, batch: Vec<Job>| {
                sink.lock().push((err.source.to_string(), err.records, batch));
            })
            .build()
            .unwrap();

        engine.push(Job { id: 1 }).unwrap();
        engine.push(Job { id: 2 }).unwrap();

        assert_eq!(
            engine.flush().await.unwrap(),
            FlushOutcome::Failed { records: 2 }
        );

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("worker failed".to_string(), 2, jobs([1, 2])));

        let metrics = engine.metrics();
        assert_eq!(metrics.flush_count, 1);
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.success_count, 0);
        assert_eq!(metrics.records_failed, 2);
        // A failed batch is never re-enqueued.
        assert_eq!(engine.pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_without_handler_is_counted_and_dropped() {
        let engine = engine_with(Arc::new(RecordingWorker::failing()), 5);
        engine.push(Job { id: 1 }).unwrap();

        assert_eq!(
            engine.flush().await.unwrap(),
            FlushOutcome::Failed { records: 1 }
        );
        assert_eq!(engine.metrics().failure_count, 1);
        assert_eq!(engine.pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn always_failing_worker_counts_every_cycle() {
        let engine = engine_with(Arc::new(RecordingWorker::failing()), 1);
        let cycles = 4;

        for id in 0..cycles {
            engine.push(Job { id }).unwrap();
            engine.flush().await.unwrap();
        }

        let metrics = engine.metrics();
        assert_eq!(metrics.flush_count, u64::from(cycles));
        assert_eq!(metrics.failure_count, u64::from(cycles));
        assert_eq!(metrics.success_count, 0);
    }

    #[tokio::test]
    async fn failed_batches_can_be_dead_lettered() {
        let dead: Arc<dyn Storage<Job>> = Arc::new(MemoryStorage::new());
        let engine = BatchEngine::<Job, usize>::builder()
            .worker(RecordingWorker::failing())
            .batch_size(2)
            .on_error(DeadLetterHandler::new(Arc::clone(&dead)))
            .build()
            .unwrap();

        for id in 1..=3 {
            engine.push(Job { id }).unwrap();
        }
        let summary = engine.drain().await.unwrap();

        assert_eq!(
            summary,
            DrainSummary {
                batches: 2,
                records: 3,
                failed_batches: 2,
            }
        );
        assert_eq!(dead.dequeue_batch(10).unwrap(), jobs([1, 2, 3]));
    }

    #[tokio::test]
    async fn concurrent_flush_is_skipped() {
        let worker = Arc::new(GatedWorker::new());
        let engine = Arc::new(
            BatchEngine::<Job, ()>::builder()
                .worker(Arc::clone(&worker))
                .batch_size(1)
                .build()
                .unwrap(),
        );
        engine.push(Job { id: 1 }).unwrap();
        engine.push(Job { id: 2 }).unwrap();

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.flush().await }
        });
        worker.entered.notified().await;

        assert_eq!(engine.flush().await.unwrap(), FlushOutcome::Skipped);
        assert_eq!(engine.metrics().skipped_count, 1);
        // The skipped cycle dequeued nothing.
        assert_eq!(engine.pending().unwrap(), 1);

        worker.gate.add_permits(1);
        assert_eq!(
            first.await.unwrap().unwrap(),
            FlushOutcome::Processed { records: 1 }
        );

        // Guard released: the next cycle proceeds.
        worker.gate.add_permits(1);
        assert_eq!(
            engine.flush().await.unwrap(),
            FlushOutcome::Processed { records: 1 }
        );
    }

    #[tokio::test]
    async fn storage_errors_propagate_from_push_and_flush() {
        let engine = BatchEngine::<Job, usize>::builder()
            .worker(RecordingWorker::default())
            .storage(BrokenStorage::default())
            .build()
            .unwrap();

        assert!(matches!(
            engine.push(Job { id: 1 }),
            Err(StorageError::Backend(_))
        ));
        assert!(engine.flush().await.is_err());
        assert_eq!(engine.metrics(), MetricsSnapshot::default());
    }

    #[tokio::test]
    async fn file_backed_engine_flushes_persisted_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        let worker = Arc::new(RecordingWorker::default());
        let engine = BatchEngine::<Job, usize>::builder()
            .worker(Arc::clone(&worker))
            .storage(FileStorage::<Job>::create(&path).unwrap())
            .batch_size(2)
            .build()
            .unwrap();

        for id in 1..=3 {
            engine.push(Job { id }).unwrap();
        }
        engine.flush().await.unwrap();

        let reopened: FileStorage<Job> = FileStorage::open(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
        assert_eq!(*worker.batches.lock(), vec![jobs([1, 2])]);
    }

    // --- timer lifecycle ---

    #[tokio::test(start_paused = true)]
    async fn start_twice_arms_a_single_timer() {
        let worker = Arc::new(RecordingWorker::default());
        let engine = engine_with(Arc::clone(&worker), 1);
        for id in 0..10 {
            engine.push(Job { id }).unwrap();
        }

        engine.start().unwrap();
        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(engine.metrics().flush_count, 3);
        assert_eq!(*worker.batches.lock(), vec![jobs([0]), jobs([1]), jobs([2])]);
        engine.stop();
    }

    #[tokio::test]
    async fn stop_before_start_is_harmless() {
        let engine = engine_with(Arc::new(RecordingWorker::default()), 1);
        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_can_restart_after_stop() {
        let engine = engine_with(Arc::new(RecordingWorker::default()), 1);
        for id in 0..10 {
            engine.push(Job { id }).unwrap();
        }

        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(engine.metrics().flush_count, 1);

        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(engine.metrics().flush_count, 1);

        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(engine.metrics().flush_count, 2);
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_does_not_wait_for_in_flight_flush() {
        let worker = Arc::new(GatedWorker::new());
        let engine = BatchEngine::<Job, ()>::builder()
            .worker(Arc::clone(&worker))
            .batch_size(1)
            .flush_interval(Duration::from_secs(1))
            .build()
            .unwrap();
        for id in 0..5 {
            engine.push(Job { id }).unwrap();
        }

        engine.start().unwrap();
        worker.entered.notified().await;

        // Returns while the worker is still blocked.
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.metrics().success_count, 0);

        // The in-flight cycle still completes, and no new cycle starts.
        worker.gate.add_permits(10);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let metrics = engine.metrics();
        assert_eq!(metrics.flush_count, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(engine.pending().unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_survives_storage_errors() {
        let storage = BrokenStorage::default();
        let dequeues = Arc::clone(&storage.dequeues);
        let engine = BatchEngine::<Job, usize>::builder()
            .worker(RecordingWorker::default())
            .storage(storage)
            .flush_interval(Duration::from_secs(1))
            .build()
            .unwrap();

        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        // One read attempt per tick: the schedule held through every error.
        assert_eq!(dequeues.load(Ordering::SeqCst), 3);
        assert_eq!(engine.state(), EngineState::Running);
        engine.stop();
    }

    /// Panics on its first call, succeeds afterwards.
    #[derive(Default)]
    struct PanicsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Worker<Job, usize> for PanicsOnce {
        async fn process(&self, batch: &[Job]) -> anyhow::Result<usize> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("worker blew up");
            }
            Ok(batch.len())
        }
    }

    #[tokio::test]
    async fn worker_panic_is_a_failed_batch() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let engine = BatchEngine::<Job, usize>::builder()
            .worker(PanicsOnce::default())
            .batch_size(2)
            .on_error(move |err: &WorkerError, batch: Vec<Job>| {
                sink.lock().push((err.source.to_string(), batch));
            })
            .build()
            .unwrap();
        for id in 1..=3 {
            engine.push(Job { id }).unwrap();
        }

        assert_eq!(
            engine.flush().await.unwrap(),
            FlushOutcome::Failed { records: 2 }
        );
        assert_eq!(
            *calls.lock(),
            vec![("worker panicked: worker blew up".to_string(), jobs([1, 2]))]
        );

        // Guard released: the next cycle runs normally.
        assert_eq!(
            engine.flush().await.unwrap(),
            FlushOutcome::Processed { records: 1 }
        );
        let metrics = engine.metrics();
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_survives_worker_panic() {
        let worker = Arc::new(PanicsOnce::default());
        let engine = BatchEngine::<Job, usize>::builder()
            .worker(Arc::clone(&worker))
            .batch_size(1)
            .flush_interval(Duration::from_secs(1))
            .build()
            .unwrap();
        for id in 0..5 {
            engine.push(Job { id }).unwrap();
        }

        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 5);
        let metrics = engine.metrics();
        assert_eq!(metrics.flush_count, 5);
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.success_count, 4);
        assert_eq!(engine.pending().unwrap(), 0);
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn timer_survives_failure_handler_panic() {
        let engine = BatchEngine::<Job, usize>::builder()
            .worker(RecordingWorker::failing())
            .batch_size(1)
            .flush_interval(Duration::from_secs(1))
            .on_error(|_: &WorkerError, _: Vec<Job>| panic!("handler blew up"))
            .build()
            .unwrap();
        for id in 0..3 {
            engine.push(Job { id }).unwrap();
        }

        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.metrics().failure_count, 3);
        assert_eq!(engine.pending().unwrap(), 0);
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn timer_keeps_flushing_when_every_batch_fails() {
        let worker = Arc::new(RecordingWorker::failing());
        let engine = engine_with(Arc::clone(&worker), 2);
        for id in 0..20 {
            engine.push(Job { id }).unwrap();
        }

        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(4_500)).await;
        engine.stop();

        let metrics = engine.metrics();
        assert_eq!(metrics.flush_count, 4);
        assert_eq!(metrics.failure_count, 4);
        assert_eq!(metrics.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_timer_and_drains() {
        let worker = Arc::new(RecordingWorker::default());
        let engine = engine_with(Arc::clone(&worker), 2);
        for id in 0..5 {
            engine.push(Job { id }).unwrap();
        }

        engine.start().unwrap();
        let summary = engine.shutdown().await.unwrap();

        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.pending().unwrap(), 0);
        assert_eq!(summary.records, 5);
        assert_eq!(summary.batches, 3);
        assert_eq!(worker.batches.lock().concat(), jobs(0..5));
    }

    #[test]
    fn start_outside_runtime_is_an_error() {
        let engine = engine_with(Arc::new(RecordingWorker::default()), 1);
        assert!(matches!(engine.start(), Err(EngineError::NoRuntime)));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    // --- properties ---

    proptest! {
        #[test]
        fn every_pushed_record_is_flushed_exactly_once(
            ids in proptest::collection::vec(any::<u32>(), 0..120),
            batch_size in 1i64..12,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let worker = Arc::new(RecordingWorker::default());
            let engine = engine_with(Arc::clone(&worker), batch_size);

            for id in &ids {
                engine.push(Job { id: *id }).unwrap();
            }
            runtime.block_on(async {
                while engine.flush().await.unwrap() != FlushOutcome::Empty {}
            });

            let batches = worker.batches.lock();
            let limit = usize::try_from(batch_size).unwrap();
            prop_assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= limit));
            prop_assert_eq!(batches.concat(), jobs(ids.iter().copied()));
        }
    }
}
