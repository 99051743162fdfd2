//! Paced record producer for demos and soak tests.

use std::sync::Arc;
use std::time::Duration;

use bufio_core::StorageError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::BatchEngine;

/// Push `count` records produced by `generator` into `engine`, waiting
/// `interval` before each push.
///
/// Runs on its own task and returns the number of records pushed. Stops at
/// the first storage error. Aborting the handle stops production between
/// pushes; records already pushed stay queued.
pub fn simulate_producer<T, U, G>(
    engine: Arc<BatchEngine<T, U>>,
    mut generator: G,
    count: usize,
    interval: Duration,
) -> JoinHandle<Result<usize, StorageError>>
where
    T: Send + Sync + 'static,
    U: Send + 'static,
    G: FnMut() -> T + Send + 'static,
{
    tokio::spawn(async move {
        for pushed in 0..count {
            tokio::time::sleep(interval).await;
            engine.push(generator())?;
            debug!(engine = %engine.name(), seq = pushed + 1, "record produced");
        }
        Ok(count)
    })
}
