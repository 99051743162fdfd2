//! Pending-record storage.
//!
//! [`Storage`] is the contract the engine drains batches from. Concrete
//! backends live in [`backends`]:
//!
//! - [`MemoryStorage`]: process-local queue, contents lost on exit
//! - [`FileStorage`]: JSON array on disk, rewritten on every operation

pub mod backend;
pub mod backends;

pub use backend::*;
pub use backends::{FileStorage, MemoryStorage};
