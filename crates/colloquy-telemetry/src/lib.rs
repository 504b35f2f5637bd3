//! Tracing setup shared by the colloquy binaries.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "colloquy_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines when true, compact human-readable output otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Build from a level name such as `"debug"`; unknown names fall back to INFO.
    pub fn from_level_name(name: &str, json: bool) -> Self {
        Self {
            log_level: name.parse().unwrap_or(Level::INFO),
            json,
            ..Self::default()
        }
    }

    fn filter_directives(&self, module_levels: &[(String, Level)]) -> String {
        let mut directives = self.log_level.to_string().to_lowercase();
        for (module, level) in module_levels {
            directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        directives
    }
}

/// Keeps the reload handle for runtime level changes.
pub struct TelemetryGuard {
    config: TelemetryConfig,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.module_levels.write();
            match levels.iter_mut().find(|(m, _)| m == module) {
                Some(entry) => entry.1 = level,
                None => levels.push((module.to_string(), level)),
            }
            self.config.filter_directives(&levels)
        };
        if let Some(handle) = &self.reload {
            if let Err(e) = handle.reload(EnvFilter::new(directives)) {
                tracing::warn!(error = %e, "failed to reload log filter");
            }
        }
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }
}

/// Initialize tracing. Call once at startup; a second call keeps the first
/// subscriber and returns a guard without a reload handle.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let module_levels = Arc::new(RwLock::new(config.module_levels.clone()));

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives(&config.module_levels)));
    let (filter, handle) = reload::Layer::new(env_filter);

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        config,
        module_levels,
        reload: installed.then_some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("colloquy_engine".into(), Level::DEBUG)],
            json: false,
        };
        assert_eq!(
            config.filter_directives(&config.module_levels),
            "warn,colloquy_engine=debug"
        );
    }

    #[test]
    fn level_name_parsing() {
        assert_eq!(TelemetryConfig::from_level_name("debug", true).log_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::from_level_name("nonsense", true).log_level, Level::INFO);
    }

    #[test]
    fn module_levels_are_tracked() {
        let guard = init_telemetry(TelemetryConfig::default());
        guard.set_module_level("colloquy_store", Level::TRACE);
        guard.set_module_level("colloquy_store", Level::ERROR);
        assert_eq!(guard.module_levels(), vec![("colloquy_store".to_string(), Level::ERROR)]);
    }
}
