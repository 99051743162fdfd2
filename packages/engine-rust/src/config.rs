use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::ConfigurationError;

/// Flush interval used when none is configured.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(5_000);

/// Engine name used as the `engine` label on logs and metrics.
pub const DEFAULT_ENGINE_NAME: &str = "bufio";

/// Batch engine configuration. Immutable once the engine is built.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Label attached to every log line and metric the engine emits.
    pub name: String,
    /// Maximum records per batch. `None` defers to the storage backend's
    /// default. Must be positive.
    pub batch_size: Option<i64>,
    /// Time between flush cycles once the engine is started.
    pub flush_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_ENGINE_NAME.to_string(),
            batch_size: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Resolve the effective batch size, using `backend_default` when none
    /// was configured.
    pub(crate) fn resolve_batch_size(
        &self,
        backend_default: usize,
    ) -> Result<NonZeroUsize, ConfigurationError> {
        match self.batch_size {
            Some(value) => usize::try_from(value)
                .ok()
                .and_then(NonZeroUsize::new)
                .ok_or(ConfigurationError::InvalidBatchSize { value }),
            None => Ok(NonZeroUsize::new(backend_default).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub(crate) fn validate_flush_interval(&self) -> Result<Duration, ConfigurationError> {
        if self.flush_interval.is_zero() {
            Err(ConfigurationError::InvalidFlushInterval)
        } else {
            Ok(self.flush_interval)
        }
    }
}
