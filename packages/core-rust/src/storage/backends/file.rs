//! File-backed [`Storage`] implementation.
//!
//! Pending records are persisted as a single JSON array. Every operation
//! reads the whole file, mutates it in memory, and writes the whole file
//! back through a sibling temp file and `rename`, so a crash never leaves a
//! half-written array behind.
//!
//! An in-process mutex serializes the read-modify-write cycle. Nothing
//! protects the file from other processes: point one `FileStorage` at one
//! path.

use std::ffi::OsString;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::StorageError;
use crate::storage::backend::Storage;

/// Durable FIFO queue stored as a JSON array at `path`.
pub struct FileStorage<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _records: PhantomData<fn() -> T>,
}

impl<T> FileStorage<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Creates a storage at `path`, discarding anything already there.
    ///
    /// Parent directories are created as needed and the file is initialized
    /// to an empty array.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file or its parent directory
    /// cannot be created.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let storage = Self::unopened(path.into());
        storage.ensure_parent()?;
        storage.write_records(&[])?;
        debug!(path = %storage.path.display(), "created file storage");
        Ok(storage)
    }

    /// Opens the storage at `path`, keeping any records persisted by an
    /// earlier run. A missing file is created as an empty array.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be read or created,
    /// or [`StorageError::Corrupt`] if it does not hold a JSON array of `T`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let storage = Self::unopened(path.into());
        if storage.path.exists() {
            let pending = storage.read_records()?.len();
            debug!(path = %storage.path.display(), pending, "opened file storage");
        } else {
            storage.ensure_parent()?;
            storage.write_records(&[])?;
            debug!(path = %storage.path.display(), "initialized missing file storage");
        }
        Ok(storage)
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unopened(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
            _records: PhantomData,
        }
    }

    fn ensure_parent(&self) -> Result<(), StorageError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))
            }
            _ => Ok(()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn read_records(&self) -> Result<Vec<T>, StorageError> {
        let raw = fs::read_to_string(&self.path).map_err(|e| StorageError::io(&self.path, e))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|source| StorageError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write_records(&self, records: &[T]) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(records)?;
        let tmp = self.temp_path();
        fs::write(&tmp, bytes).map_err(|e| StorageError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StorageError::io(&self.path, e))
    }
}

impl<T> Storage<T> for FileStorage<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn enqueue(&self, record: T) -> Result<(), StorageError> {
        let _guard = self.lock.lock();
        let mut records = self.read_records()?;
        records.push(record);
        self.write_records(&records)
    }

    fn dequeue_batch(&self, max_count: usize) -> Result<Vec<T>, StorageError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.lock.lock();
        let mut records = self.read_records()?;
        if records.is_empty() {
            return Ok(records);
        }
        let take = max_count.min(records.len());
        let remaining = records.split_off(take);
        self.write_records(&remaining)?;
        Ok(records)
    }

    fn len(&self) -> Result<usize, StorageError> {
        let _guard = self.lock.lock();
        Ok(self.read_records()?.len())
    }
}
