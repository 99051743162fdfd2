//! `Storage` implementations.
//!
//! Provides concrete backends for the [`Storage`](super::Storage) trait.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;
