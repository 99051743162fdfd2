//! Error types raised by storage backends.

use std::path::PathBuf;

/// Errors returned by [`Storage`](crate::Storage) operations.
///
/// Storage errors are never swallowed by the engine: they propagate to
/// whoever called `push` or `flush`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize records: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage file {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Failure reported by a caller-provided backend.
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
