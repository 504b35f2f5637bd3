//! # colloquy-settings
//!
//! Layered configuration: compiled defaults, then the user's settings file
//! (deep-merged), then `COLLOQUY_*` environment variables.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
