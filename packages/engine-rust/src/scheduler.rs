//! Cancellable repeating timer that drives flush cycles.
//!
//! Provides a [`FlushScheduler`] that calls a [`PeriodicTask`] once per
//! interval on a single Tokio task until it is cancelled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// PeriodicTask trait
// ---------------------------------------------------------------------------

/// Work executed by a [`FlushScheduler`] on every tick.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    /// Called once per interval. Ticks never overlap: the next tick is not
    /// taken until this future completes.
    async fn on_tick(&self);
}

// ---------------------------------------------------------------------------
// FlushScheduler
// ---------------------------------------------------------------------------

/// Handle to a running repeating timer.
///
/// The spawned task:
/// 1. Waits one full `period` before the first tick
/// 2. Calls [`PeriodicTask::on_tick`] on each tick, skipping ticks missed
///    while a previous call was still running
/// 3. Exits at the first tick boundary after cancellation
///
/// Cancellation never interrupts an `on_tick` call already in progress.
/// Dropping the handle cancels the timer without waiting for the task.
#[derive(Debug)]
pub struct FlushScheduler {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    /// Spawn the timer loop on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoRuntime`] when called outside a Tokio runtime.
    pub fn start<P: PeriodicTask>(task: Arc<P>, period: Duration) -> Result<Self, EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = runtime.spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticks.tick() => task.on_tick().await,
                }
            }
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Request cancellation. Returns immediately; idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the timer task has exited (cancelled or panicked).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the timer and wait for the task, including any tick still in
    /// progress, to finish.
    pub async fn stop_and_wait(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
