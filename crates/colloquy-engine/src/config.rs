use std::time::Duration;

use crate::context::ContextConfig;
use crate::processor::GenerationConfig;

/// Everything the engine needs from configuration, as plain values.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub generation: GenerationConfig,
    pub context: ContextConfig,
    pub tool_timeout: Duration,
    /// Share top-level sessions as soon as they are created.
    pub auto_share: bool,
    /// How long `remove` waits for an aborted generation to wind down.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            context: ContextConfig::default(),
            tool_timeout: Duration::from_secs(120),
            auto_share: false,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
