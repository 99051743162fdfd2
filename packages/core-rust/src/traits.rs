use std::sync::Arc;

use async_trait::async_trait;

/// Consumer of record batches.
///
/// The engine calls [`process`](Worker::process) with each non-empty batch it
/// drains from storage. The batch is borrowed so the engine keeps ownership
/// and can hand the exact same records to a failure handler if processing
/// fails. No timeout is imposed; any `Err` counts as a failed batch.
#[async_trait]
pub trait Worker<T, U>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    /// Process one batch. Never called with an empty slice.
    async fn process(&self, batch: &[T]) -> anyhow::Result<U>;
}

#[async_trait]
impl<T, U, W> Worker<T, U> for Arc<W>
where
    T: Send + Sync + 'static,
    W: Worker<T, U> + ?Sized,
{
    async fn process(&self, batch: &[T]) -> anyhow::Result<U> {
        (**self).process(batch).await
    }
}
