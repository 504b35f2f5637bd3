use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;

use crate::error::StoreError;
use crate::keys;
use crate::storage::Storage;

pub const SCHEMA_VERSION: u32 = 1;

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// Thread-safe SQLite connection wrapper.
/// Uses parking_lot::Mutex for synchronous access (rusqlite is not Sync).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        let db = Self::init(conn, path.to_owned())?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;
        if version.is_none() {
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])
                .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Execute a closure with the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Key/value documents in a single SQLite table.
pub struct SqliteStorage {
    db: Database,
}

impl SqliteStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    /// Half-open key range covering everything strictly below `prefix`.
    /// `'0'` is the byte after `'/'`.
    fn range(prefix: &str) -> Result<(String, String), StoreError> {
        keys::validate(prefix)?;
        Ok((format!("{prefix}/"), format!("{prefix}0")))
    }
}

impl Storage for SqliteStorage {
    fn write_json(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        keys::validate(key)?;
        let text = serde_json::to_string(value)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO documents (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, text, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn read_json(&self, key: &str) -> Result<Value, StoreError> {
        keys::validate(key)?;
        let text: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT value FROM documents WHERE key = ?1", [key], |row| row.get(0))
                .optional()?)
        })?;
        let text = text.ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let (lo, hi) = Self::range(prefix)?;
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key FROM documents WHERE key >= ?1 AND key < ?2 ORDER BY key")?;
            let keys = stmt
                .query_map(params![lo, hi], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        keys::validate(key)?;
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM documents WHERE key = ?1", [key])?;
            Ok(())
        })
    }

    fn remove_dir(&self, prefix: &str) -> Result<(), StoreError> {
        let (lo, hi) = Self::range(prefix)?;
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM documents WHERE key >= ?1 AND key < ?2", params![lo, hi])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_in_memory() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.path(), Path::new(":memory:"));
    }

    #[test]
    fn reopen_preserves_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db/store.db");
        SqliteStorage::open(&path).unwrap().write_json("a/1", &json!({"v": 1})).unwrap();

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.read_json("a/1").unwrap(), json!({"v": 1}));
        let versions: i64 = storage
            .db
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn prefix_range_excludes_siblings() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.write_json("p", &json!(0)).unwrap();
        storage.write_json("p/1", &json!(1)).unwrap();
        storage.write_json("p0", &json!(2)).unwrap();
        storage.write_json("p-x/1", &json!(3)).unwrap();
        assert_eq!(storage.list("p").unwrap(), vec!["p/1"]);
    }
}
