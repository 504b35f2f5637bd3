//! Settings loading with deep merge and environment variable overrides.
//!
//! 1. Start with [`ColloquySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `COLLOQUY_*` environment overrides
//!
//! Objects merge recursively, arrays and primitives are replaced, and
//! nulls in the file are skipped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{default_data_dir, ColloquySettings, StorageBackend};

pub fn settings_path() -> PathBuf {
    default_data_dir().join("settings.json")
}

pub fn load_settings() -> Result<ColloquySettings> {
    load_settings_from_path(&settings_path())
}

/// Missing file yields defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ColloquySettings> {
    let defaults = serde_json::to_value(ColloquySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ColloquySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup`. Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut ColloquySettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("COLLOQUY_DATA_DIR") {
        settings.storage.data_dir = PathBuf::from(v);
    }
    if let Some(v) = read("COLLOQUY_STORAGE_BACKEND") {
        match parse_backend(&v) {
            Some(backend) => settings.storage.backend = backend,
            None => warn!(key = "COLLOQUY_STORAGE_BACKEND", value = %v, "invalid storage backend, ignoring"),
        }
    }
    if let Some(v) = read("COLLOQUY_MAX_RETRIES") {
        match parse_u32_range(&v, 0, 100) {
            Some(n) => settings.generation.max_retries = n,
            None => warn!(key = "COLLOQUY_MAX_RETRIES", value = %v, "invalid retry count, ignoring"),
        }
    }
    if let Some(v) = read("COLLOQUY_GENERATE_TITLES") {
        match parse_bool(&v) {
            Some(b) => settings.generation.generate_titles = b,
            None => warn!(key = "COLLOQUY_GENERATE_TITLES", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("COLLOQUY_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

fn parse_backend(val: &str) -> Option<StorageBackend> {
    match val.to_lowercase().as_str() {
        "file" => Some(StorageBackend::File),
        "sqlite" => Some(StorageBackend::Sqlite),
        _ => None,
    }
}
