use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::StoreError;
use crate::file::FileStorage;
use crate::sqlite::SqliteStorage;

/// Durable key to JSON document store.
///
/// Writes are overwrite-by-key. `list` returns every key strictly below
/// `prefix` in sorted order. Removing a missing key is not an error.
pub trait Storage: Send + Sync {
    fn write_json(&self, key: &str, value: &Value) -> Result<(), StoreError>;
    fn read_json(&self, key: &str) -> Result<Value, StoreError>;
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn remove_dir(&self, prefix: &str) -> Result<(), StoreError>;
}

/// Write notification published after a successful mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageEvent {
    Written { key: String },
    Removed { key: String },
}

const WATCH_CAPACITY: usize = 1024;

/// Typed, cloneable handle over a [`Storage`] backend.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Storage>,
    events: broadcast::Sender<StorageEvent>,
}

impl Store {
    pub fn new(backend: Arc<dyn Storage>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self { backend, events }
    }

    /// Directory of JSON files rooted at `root`.
    pub fn file(root: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(FileStorage::open(root)?)))
    }

    /// SQLite key/value table at `path`.
    pub fn sqlite(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SqliteStorage::open(path)?)))
    }

    /// In-memory SQLite store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SqliteStorage::in_memory()?)))
    }

    pub fn watch(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.write_json(key, &value)
    }

    pub fn write_json(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.backend.write_json(key, value)?;
        trace!(key, "storage write");
        let _ = self.events.send(StorageEvent::Written { key: key.to_string() });
        Ok(())
    }

    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let value = self.backend.read_json(key)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn read_json(&self, key: &str) -> Result<Value, StoreError> {
        self.backend.read_json(key)
    }

    /// `Ok(None)` when the key does not exist.
    pub fn read_optional<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.read(key) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.backend.list(prefix)
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.backend.remove(key)?;
        let _ = self.events.send(StorageEvent::Removed { key: key.to_string() });
        Ok(())
    }

    pub fn remove_dir(&self, prefix: &str) -> Result<(), StoreError> {
        self.backend.remove_dir(prefix)?;
        let _ = self.events.send(StorageEvent::Removed { key: prefix.to_string() });
        Ok(())
    }
}
