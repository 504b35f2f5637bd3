//! Settings schema. Every section defaults independently so a partial
//! file only overrides what it names.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColloquySettings {
    pub storage: StorageSettings,
    pub generation: GenerationSettings,
    pub tools: ToolSettings,
    pub share: ShareSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    File,
    Sqlite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Attempts per step after a transport failure.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Upper bound on model steps within one generation.
    pub max_steps: u32,
    /// Cap on the output budget reserved from the context window.
    pub output_token_max: u64,
    /// Summarize once usage exceeds this percentage of the usable context.
    pub summarize_at_percent: u64,
    pub tool_timeout_ms: u64,
    pub generate_titles: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            max_steps: 256,
            output_token_max: 32_000,
            summarize_at_percent: 90,
            tool_timeout_ms: 120_000,
            generate_titles: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Tools hidden from the model.
    pub disabled: Vec<String>,
    /// Tools whose calls are refused by the permission policy.
    pub deny: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareSettings {
    /// Share every new top-level session.
    pub auto: bool,
    /// Base of generated share links; sharing is disabled when unset.
    pub base_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
        }
    }
}

/// `~/.colloquy`, or `/tmp/.colloquy` without a home directory.
pub fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".colloquy")
}
