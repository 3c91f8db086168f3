//! Builds the completion-service client for the configured provider.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sita_ai::{
    GoogleClient, GoogleConfig, LlmClient, OpenAiClient, OpenAiConfig, Provider, ProviderWire,
};
use sita_cli::{ApiKeySource, Configuration};

const DEFAULT_RETRY_BUDGET_MS: u64 = 30_000;

/// Transport settings that come from the command line rather than the
/// persisted configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base: Option<String>,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base: None,
            request_timeout_ms: 120_000,
            max_retries: 2,
        }
    }
}

pub fn build_provider_client(
    configuration: &Configuration,
    settings: &ClientSettings,
) -> Result<Arc<dyn LlmClient>> {
    let provider = configuration.provider;
    let key = configuration.resolve_api_key(provider).ok_or_else(|| {
        anyhow!(
            "no API key for {}: run `config set {} <key>` or export {}",
            provider.display_name(),
            sita_cli::api_key_setting(provider),
            provider.api_key_env()
        )
    })?;
    match &key.source {
        ApiKeySource::Setting => tracing::debug!(provider = %provider, "using stored API key"),
        ApiKeySource::Environment(name) => {
            tracing::debug!(provider = %provider, env = *name, "using API key from environment")
        }
    }

    let api_base = settings
        .api_base
        .clone()
        .filter(|base| !base.trim().is_empty())
        .unwrap_or_else(|| provider.default_api_base().to_string());

    match provider.wire() {
        ProviderWire::OpenAiChatCompletions => {
            let client = OpenAiClient::new(OpenAiConfig {
                api_base,
                api_key: key.value,
                request_timeout_ms: settings.request_timeout_ms,
                max_retries: settings.max_retries,
                retry_budget_ms: DEFAULT_RETRY_BUDGET_MS,
                retry_jitter: true,
                extra_headers: provider_headers(provider),
            })
            .with_context(|| format!("failed to build {} client", provider.display_name()))?;
            Ok(Arc::new(client))
        }
        ProviderWire::GoogleGenerateContent => {
            let client = GoogleClient::new(GoogleConfig {
                api_base,
                api_key: key.value,
                request_timeout_ms: settings.request_timeout_ms,
                max_retries: settings.max_retries,
                retry_budget_ms: DEFAULT_RETRY_BUDGET_MS,
                retry_jitter: true,
            })
            .with_context(|| format!("failed to build {} client", provider.display_name()))?;
            Ok(Arc::new(client))
        }
    }
}

fn provider_headers(provider: Provider) -> Vec<(String, String)> {
    match provider {
        Provider::OpenRouter => vec![("X-Title".to_string(), "sita".to_string())],
        Provider::OpenAi | Provider::Google | Provider::Together => Vec::new(),
    }
}
