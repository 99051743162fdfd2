//! `bufio` Core — storage and worker contracts plus the built-in storage backends.
//!
//! The batching engine in `bufio-engine` is written against the two
//! capability traits defined here:
//!
//! - [`Storage`]: where pending records wait (`enqueue` / `dequeue_batch`)
//! - [`Worker`]: what happens to a batch once it leaves storage
//!
//! Two backends ship with the crate: [`MemoryStorage`] (volatile, the
//! engine's default) and [`FileStorage`] (a JSON array on disk).

pub mod error;
pub mod storage;
pub mod traits;

pub use error::StorageError;
pub use storage::{FileStorage, MemoryStorage, Storage, DEFAULT_BATCH_SIZE};
pub use traits::Worker;
