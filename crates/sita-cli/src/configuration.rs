use std::collections::BTreeMap;
use std::path::Path;

use sita_ai::Provider;
use sita_session::ConfigSnapshot;
use thiserror::Error;

use crate::{Cli, SettingsStore};

pub const SETTINGS_DB_FILE_NAME: &str = "sita.db";

pub const KEY_PROVIDER: &str = "agent.provider";
pub const KEY_MODEL: &str = "agent.model";
pub const KEY_TEMPERATURE: &str = "agent.temperature";
pub const KEY_MAX_TOKENS: &str = "agent.max_tokens";
pub const KEY_SHOW_TOOL_CALLS: &str = "ui.show_tool_calls";
pub const KEY_MARKDOWN: &str = "ui.markdown";

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 2000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key '{0}'. Known keys: {known}", known = known_keys().join(", "))]
    UnknownKey(String),
    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("settings store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Per-provider API key setting, e.g. `agent.openai_api_key`.
pub fn api_key_setting(provider: Provider) -> &'static str {
    match provider {
        Provider::OpenAi => "agent.openai_api_key",
        Provider::Google => "agent.google_api_key",
        Provider::OpenRouter => "agent.openrouter_api_key",
        Provider::Together => "agent.together_api_key",
    }
}

/// Every key accepted by [`Configuration::set`], in display order.
pub fn known_keys() -> Vec<String> {
    let mut keys = vec![
        KEY_PROVIDER.to_string(),
        KEY_MODEL.to_string(),
        KEY_TEMPERATURE.to_string(),
        KEY_MAX_TOKENS.to_string(),
    ];
    keys.extend(
        Provider::ALL
            .iter()
            .map(|provider| api_key_setting(*provider).to_string()),
    );
    keys.push(KEY_SHOW_TOOL_CALLS.to_string());
    keys.push(KEY_MARKDOWN.to_string());
    keys
}

/// Where a resolved API key came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeySource {
    Setting,
    Environment(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedApiKey {
    pub value: String,
    pub source: ApiKeySource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

/// Explicit settings object; the REPL mutates it only through [`Configuration::set`].
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub provider: Provider,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub show_tool_calls: bool,
    pub render_markdown: bool,
    api_keys: BTreeMap<Provider, String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
            model: Provider::OpenAi.default_model().to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            show_tool_calls: true,
            render_markdown: true,
            api_keys: BTreeMap::new(),
        }
    }
}

impl Configuration {
    /// Loads settings from `<data_dir>/sita.db`, persisting defaults on first run.
    pub fn load_from_data_dir(data_dir: &Path) -> Result<(Self, SettingsStore), ConfigError> {
        let store = SettingsStore::open(data_dir.join(SETTINGS_DB_FILE_NAME))?;
        let configuration = Self::load(&store)?;
        Ok((configuration, store))
    }

    pub fn load(store: &SettingsStore) -> Result<Self, ConfigError> {
        let stored = store.load_all()?;
        if stored.is_empty() {
            let configuration = Self::default();
            configuration.save(store)?;
            tracing::info!(path = %store.path().display(), "initialized settings with defaults");
            return Ok(configuration);
        }

        let mut configuration = Self::default();
        // Provider first so a stored model is not reset afterwards.
        if let Some(provider) = stored.get(KEY_PROVIDER) {
            configuration.apply_stored(KEY_PROVIDER, provider);
        }
        for (key, value) in &stored {
            if key == KEY_PROVIDER {
                continue;
            }
            configuration.apply_stored(key, value);
        }
        Ok(configuration)
    }

    fn apply_stored(&mut self, key: &str, value: &str) {
        let result = if key == KEY_MODEL {
            self.set_model(value)
        } else {
            self.set(key, value).map(|_| ())
        };
        if let Err(error) = result {
            tracing::warn!(key, error = %error, "ignoring invalid stored setting");
        }
    }

    /// Writes every setting back to the store.
    pub fn save(&self, store: &SettingsStore) -> Result<(), ConfigError> {
        store.write_changes(
            self.raw_entries()
                .into_iter()
                .map(|(key, value)| (key, Some(value))),
        )
    }

    /// Writes only `keys`, as returned by [`Configuration::set`].
    ///
    /// Other fields may carry run-scoped CLI overrides and stay untouched in
    /// the store. A cleared API key removes its row.
    pub fn persist_keys(&self, store: &SettingsStore, keys: &[String]) -> Result<(), ConfigError> {
        store.write_changes(keys.iter().map(|key| (key.as_str(), self.raw_value(key))))
    }

    fn raw_entries(&self) -> Vec<(&'static str, String)> {
        let mut entries = vec![
            (KEY_PROVIDER, self.provider.as_str().to_string()),
            (KEY_MODEL, self.model.clone()),
            (KEY_TEMPERATURE, self.temperature.to_string()),
            (KEY_MAX_TOKENS, self.max_tokens.to_string()),
            (KEY_SHOW_TOOL_CALLS, self.show_tool_calls.to_string()),
            (KEY_MARKDOWN, self.render_markdown.to_string()),
        ];
        for (provider, key) in &self.api_keys {
            entries.push((api_key_setting(*provider), key.clone()));
        }
        entries
    }

    fn raw_value(&self, key: &str) -> Option<String> {
        self.raw_entries()
            .into_iter()
            .find(|(known, _)| *known == key)
            .map(|(_, value)| value)
    }

    /// Validates and applies one setting. Returns the keys whose value changed,
    /// which includes `agent.model` when a provider switch resets it.
    pub fn set(&mut self, key: &str, value: &str) -> Result<Vec<String>, ConfigError> {
        let key = key.trim();
        let value = value.trim();
        match key {
            KEY_PROVIDER => {
                let provider = value.parse::<Provider>().map_err(|error| {
                    invalid_value(key, value, error.to_string())
                })?;
                if provider == self.provider {
                    return Ok(Vec::new());
                }
                self.provider = provider;
                self.model = provider.default_model().to_string();
                Ok(vec![KEY_PROVIDER.to_string(), KEY_MODEL.to_string()])
            }
            KEY_MODEL => {
                self.set_model(value)?;
                Ok(vec![KEY_MODEL.to_string()])
            }
            KEY_TEMPERATURE => {
                let parsed = value
                    .parse::<f32>()
                    .map_err(|error| invalid_value(key, value, error.to_string()))?;
                if !parsed.is_finite() || !(0.0..=2.0).contains(&parsed) {
                    return Err(invalid_value(key, value, "must be within 0.0..=2.0"));
                }
                self.temperature = parsed;
                Ok(vec![KEY_TEMPERATURE.to_string()])
            }
            KEY_MAX_TOKENS => {
                let parsed = value
                    .parse::<u32>()
                    .map_err(|error| invalid_value(key, value, error.to_string()))?;
                if parsed == 0 {
                    return Err(invalid_value(key, value, "must be greater than 0"));
                }
                self.max_tokens = parsed;
                Ok(vec![KEY_MAX_TOKENS.to_string()])
            }
            KEY_SHOW_TOOL_CALLS => {
                self.show_tool_calls = parse_bool(key, value)?;
                Ok(vec![KEY_SHOW_TOOL_CALLS.to_string()])
            }
            KEY_MARKDOWN => {
                self.render_markdown = parse_bool(key, value)?;
                Ok(vec![KEY_MARKDOWN.to_string()])
            }
            other => {
                let Some(provider) = Provider::ALL
                    .iter()
                    .copied()
                    .find(|provider| api_key_setting(*provider) == other)
                else {
                    return Err(ConfigError::UnknownKey(other.to_string()));
                };
                if value.is_empty() {
                    self.api_keys.remove(&provider);
                } else {
                    self.api_keys.insert(provider, value.to_string());
                }
                Ok(vec![other.to_string()])
            }
        }
    }

    fn set_model(&mut self, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(invalid_value(
                KEY_MODEL,
                value,
                "model must be a non-empty identifier without whitespace",
            ));
        }
        self.model = value.to_string();
        Ok(())
    }

    /// Applies run-scoped CLI overrides. Nothing here is persisted.
    pub fn apply_cli_overrides(&mut self, cli: &Cli) {
        if let Some(provider) = cli.provider {
            if provider != self.provider {
                self.provider = provider;
                self.model = provider.default_model().to_string();
            }
        }
        if let Some(model) = cli.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            self.model = model.to_string();
        }
        if let Some(temperature) = cli.temperature {
            self.temperature = temperature;
        }
        if let Some(max_tokens) = cli.max_tokens {
            self.max_tokens = max_tokens;
        }
    }

    /// Stored key first, then the provider's environment variable.
    pub fn resolve_api_key(&self, provider: Provider) -> Option<ResolvedApiKey> {
        self.resolve_api_key_with(provider, |name| std::env::var(name).ok())
    }

    pub fn resolve_api_key_with<F>(&self, provider: Provider, env_lookup: F) -> Option<ResolvedApiKey>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(stored) = self.api_keys.get(&provider).filter(|key| !key.trim().is_empty()) {
            return Some(ResolvedApiKey {
                value: stored.clone(),
                source: ApiKeySource::Setting,
            });
        }
        let env_name = provider.api_key_env();
        env_lookup(env_name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(|value| ResolvedApiKey {
                value,
                source: ApiKeySource::Environment(env_name),
            })
    }

    /// Display rows with API keys masked.
    pub fn entries(&self) -> Vec<ConfigEntry> {
        self.entries_with(|name| std::env::var(name).ok())
    }

    pub fn entries_with<F>(&self, env_lookup: F) -> Vec<ConfigEntry>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut entries = vec![
            entry(KEY_PROVIDER, self.provider.as_str().to_string()),
            entry(KEY_MODEL, self.model.clone()),
            entry(KEY_TEMPERATURE, self.temperature.to_string()),
            entry(KEY_MAX_TOKENS, self.max_tokens.to_string()),
        ];
        for provider in Provider::ALL {
            let shown = match self.resolve_api_key_with(provider, &env_lookup) {
                Some(ResolvedApiKey {
                    value,
                    source: ApiKeySource::Setting,
                }) => mask_secret(&value),
                Some(ResolvedApiKey {
                    value,
                    source: ApiKeySource::Environment(name),
                }) => format!("{} (from {name})", mask_secret(&value)),
                None => "(not set)".to_string(),
            };
            entries.push(entry(api_key_setting(provider), shown));
        }
        entries.push(entry(KEY_SHOW_TOOL_CALLS, self.show_tool_calls.to_string()));
        entries.push(entry(KEY_MARKDOWN, self.render_markdown.to_string()));
        entries
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            provider: self.provider.as_str().to_string(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            show_tool_calls: self.show_tool_calls,
            render_markdown: self.render_markdown,
        }
    }
}

fn entry(key: &str, value: String) -> ConfigEntry {
    ConfigEntry {
        key: key.to_string(),
        value,
    }
}

fn invalid_value(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(invalid_value(key, value, "expected true or false")),
    }
}

/// Keeps the first 3 and last 4 characters of long secrets.
pub fn mask_secret(secret: &str) -> String {
    let chars = secret.chars().collect::<Vec<_>>();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head = chars[..3].iter().collect::<String>();
    let tail = chars[chars.len() - 4..].iter().collect::<String>();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests;
