use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::keys;
use crate::storage::Storage;

const EXTENSION: &str = "json";

/// One JSON file per key under a root directory. Writes go to a sibling
/// temp file first and are renamed into place.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root).map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        info!(path = %root.display(), "file storage opened");
        Ok(Self { root: root.to_owned() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        keys::validate(key)?;
        Ok(self.root.join(format!("{key}.{EXTENSION}")))
    }

    fn dir_path(&self, prefix: &str) -> Result<PathBuf, StoreError> {
        keys::validate(prefix)?;
        Ok(self.root.join(prefix))
    }

    fn collect(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect(&path, &format!("{prefix}/{name}"), out)?;
            } else if let Some(stem) = name.strip_suffix(&format!(".{EXTENSION}")) {
                out.push(format!("{prefix}/{stem}"));
            }
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn write_json(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let path = self.file_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent)?;

        let tmp = parent.join(format!(".{}.{}.tmp", keys::leaf(key), Uuid::now_v7().simple()));
        let bytes = serde_json::to_vec_pretty(value)?;
        if let Err(e) = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn read_json(&self, key: &str) -> Result<Value, StoreError> {
        let path = self.file_path(key)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.dir_path(prefix)?;
        let mut keys = Vec::new();
        self.collect(&dir, prefix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.file_path(key)?) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn remove_dir(&self, prefix: &str) -> Result<(), StoreError> {
        let dir = self.dir_path(prefix)?;
        match fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => {
                debug!(prefix, "removed directory");
                Ok(())
            }
        }
    }
}
