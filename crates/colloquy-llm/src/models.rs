use colloquy_core::provider::ModelLimits;
use colloquy_core::tokens::TokenUsage;

/// Provider families with prompt or schema quirks.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Google,
    Other(String),
}

/// Provider-specific adjustments applied when building a request.
#[derive(Clone, Debug, PartialEq)]
pub struct Capabilities {
    /// Merge system prompts down to at most this many blocks.
    pub max_system_blocks: Option<usize>,
    pub default_temperature: Option<f64>,
    /// JSON-schema keys the provider rejects in tool parameters.
    pub strip_schema_keys: &'static [&'static str],
}

impl ProviderKind {
    pub fn from_id(id: &str) -> Self {
        match id {
            "anthropic" => Self::Anthropic,
            "openai" => Self::OpenAi,
            "google" => Self::Google,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Google => "google",
            Self::Other(id) => id,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Anthropic => Capabilities {
                max_system_blocks: Some(2),
                default_temperature: Some(0.0),
                strip_schema_keys: &[],
            },
            Self::OpenAi => Capabilities {
                max_system_blocks: None,
                default_temperature: None,
                strip_schema_keys: &[],
            },
            Self::Google => Capabilities {
                max_system_blocks: None,
                default_temperature: Some(0.0),
                strip_schema_keys: &["additionalProperties", "$schema"],
            },
            Self::Other(_) => Capabilities {
                max_system_blocks: None,
                default_temperature: None,
                strip_schema_keys: &[],
            },
        }
    }
}

/// Catalog entry for a known model.
#[derive(Clone, Debug)]
pub struct ModelInfo {
    pub provider: &'static str,
    pub name: &'static str,
    pub limits: ModelLimits,
    pub input_cost_per_mtok: f64,
    pub output_cost_per_mtok: f64,
    pub cache_read_cost_per_mtok: f64,
    pub cache_write_cost_per_mtok: f64,
}

impl ModelInfo {
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        let per = |tokens: u64, rate: f64| tokens as f64 / 1_000_000.0 * rate;
        per(usage.input, self.input_cost_per_mtok)
            + per(usage.output + usage.reasoning, self.output_cost_per_mtok)
            + per(usage.cache_read, self.cache_read_cost_per_mtok)
            + per(usage.cache_write, self.cache_write_cost_per_mtok)
    }
}

static MODELS: &[ModelInfo] = &[
    ModelInfo {
        provider: "anthropic",
        name: "claude-sonnet-4-5",
        limits: ModelLimits { context: 200_000, output: 64_000 },
        input_cost_per_mtok: 3.0,
        output_cost_per_mtok: 15.0,
        cache_read_cost_per_mtok: 0.3,
        cache_write_cost_per_mtok: 3.75,
    },
    ModelInfo {
        provider: "anthropic",
        name: "claude-haiku-4-5",
        limits: ModelLimits { context: 200_000, output: 64_000 },
        input_cost_per_mtok: 1.0,
        output_cost_per_mtok: 5.0,
        cache_read_cost_per_mtok: 0.1,
        cache_write_cost_per_mtok: 1.25,
    },
    ModelInfo {
        provider: "openai",
        name: "gpt-4.1",
        limits: ModelLimits { context: 1_047_576, output: 32_768 },
        input_cost_per_mtok: 2.0,
        output_cost_per_mtok: 8.0,
        cache_read_cost_per_mtok: 0.5,
        cache_write_cost_per_mtok: 0.0,
    },
    ModelInfo {
        provider: "google",
        name: "gemini-2.5-pro",
        limits: ModelLimits { context: 1_048_576, output: 65_536 },
        input_cost_per_mtok: 1.25,
        output_cost_per_mtok: 10.0,
        cache_read_cost_per_mtok: 0.31,
        cache_write_cost_per_mtok: 0.0,
    },
];

pub fn find_model(provider: &str, name: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.provider == provider && m.name == name)
}

pub fn all_models() -> &'static [ModelInfo] {
    MODELS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_roundtrip() {
        for id in ["anthropic", "openai", "google", "local"] {
            assert_eq!(ProviderKind::from_id(id).id(), id);
        }
        assert_eq!(ProviderKind::from_id("local"), ProviderKind::Other("local".into()));
    }

    #[test]
    fn capability_table() {
        assert_eq!(ProviderKind::Anthropic.capabilities().max_system_blocks, Some(2));
        assert!(ProviderKind::Google
            .capabilities()
            .strip_schema_keys
            .contains(&"additionalProperties"));
        assert_eq!(ProviderKind::OpenAi.capabilities().default_temperature, None);
    }

    #[test]
    fn lookup_and_cost() {
        let model = find_model("anthropic", "claude-sonnet-4-5").unwrap();
        let usage = TokenUsage { input: 1_000_000, output: 100_000, ..Default::default() };
        assert!((model.cost(&usage) - 4.5).abs() < 1e-9);
        assert!(find_model("openai", "claude-sonnet-4-5").is_none());
        assert_eq!(all_models().len(), 4);
    }
}
