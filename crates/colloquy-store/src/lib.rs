//! Persistence for sessions, messages and parts: a key to JSON document
//! store with a file backend and a SQLite backend.

pub mod error;
pub mod file;
pub mod keys;
pub mod messages;
pub mod sessions;
pub mod sqlite;
pub mod storage;

pub use error::StoreError;
pub use messages::MessageRepo;
pub use sessions::SessionRepo;
pub use sqlite::Database;
pub use storage::{Storage, StorageEvent, Store};
