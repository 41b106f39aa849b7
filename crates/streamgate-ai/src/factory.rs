//! Backend selection from configuration.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use streamgate_core::TokenSourceFactory;

use crate::mock::MockBackend;
use crate::openai::OpenAiBackend;

const DEFAULT_MOCK_MODEL: &str = "echo";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Supported upstream providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Mock,
    #[serde(rename = "openai")]
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Mock => "mock",
            ProviderKind::OpenAi => "openai",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(ProviderKind::Mock),
            "openai" => Ok(ProviderKind::OpenAi),
            other => Err(format!("unknown inference provider '{}'", other)),
        }
    }
}

/// Settings of the upstream inference backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub mock_token_delay_ms: u64,
}

impl BackendConfig {
    /// Configured model, or the provider's default.
    pub fn model_or_default(&self) -> &str {
        match (&self.model, self.provider) {
            (Some(model), _) => model,
            (None, ProviderKind::Mock) => DEFAULT_MOCK_MODEL,
            (None, ProviderKind::OpenAi) => DEFAULT_OPENAI_MODEL,
        }
    }
}

/// Build the token source factory described by `config`.
pub fn build_backend(config: &BackendConfig) -> Arc<dyn TokenSourceFactory> {
    let model = config.model_or_default();
    match config.provider {
        ProviderKind::Mock => {
            Arc::new(MockBackend::new(model).with_token_delay(config.mock_token_delay_ms))
        }
        ProviderKind::OpenAi => {
            let mut backend = OpenAiBackend::new(model);
            if let Some(api_key) = &config.api_key {
                backend = backend.with_api_key(api_key);
            }
            if let Some(base_url) = &config.base_url {
                backend = backend.with_base_url(base_url);
            }
            if let Some(prompt) = &config.system_prompt {
                backend = backend.with_system_prompt(prompt);
            }
            Arc::new(backend)
        }
    }
}
