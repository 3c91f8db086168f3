use std::{fmt, str::FromStr};

use thiserror::Error;

/// Completion-service providers sita can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Provider {
    OpenAi,
    Google,
    OpenRouter,
    Together,
}

/// Request/response format spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderWire {
    OpenAiChatCompletions,
    GoogleGenerateContent,
}

/// One entry of the static per-provider model catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub description: &'static str,
}

const OPENAI_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "gpt-4o",
        description: "Latest GPT-4 model, best for complex tasks",
    },
    ModelInfo {
        id: "gpt-4o-mini",
        description: "Faster, cost-effective GPT-4",
    },
    ModelInfo {
        id: "gpt-3.5-turbo",
        description: "Fast and efficient for simpler tasks",
    },
    ModelInfo {
        id: "o1-preview",
        description: "Advanced reasoning model",
    },
    ModelInfo {
        id: "o1-mini",
        description: "Compact reasoning model",
    },
];

const GOOGLE_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "gemini-2.0-flash-exp",
        description: "Latest experimental Gemini model",
    },
    ModelInfo {
        id: "gemini-1.5-pro",
        description: "Production-ready Gemini Pro",
    },
    ModelInfo {
        id: "gemini-1.5-flash",
        description: "Fast Gemini model",
    },
];

const OPENROUTER_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "openai/gpt-4o",
        description: "GPT-4o via OpenRouter",
    },
    ModelInfo {
        id: "anthropic/claude-3.5-sonnet",
        description: "Claude 3.5 Sonnet",
    },
    ModelInfo {
        id: "meta-llama/llama-3.1-405b-instruct",
        description: "Llama 3.1 405B",
    },
    ModelInfo {
        id: "mistralai/mixtral-8x7b-instruct",
        description: "Mixtral 8x7B",
    },
    ModelInfo {
        id: "google/gemini-pro-1.5",
        description: "Gemini Pro 1.5",
    },
];

const TOGETHER_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "meta-llama/Meta-Llama-3.1-8B-Instruct-Turbo",
        description: "Llama 3.1 8B Turbo",
    },
    ModelInfo {
        id: "meta-llama/Meta-Llama-3.1-70B-Instruct-Turbo",
        description: "Llama 3.1 70B Turbo",
    },
    ModelInfo {
        id: "mistralai/Mixtral-8x7B-Instruct-v0.1",
        description: "Mixtral 8x7B",
    },
    ModelInfo {
        id: "NousResearch/Nous-Hermes-2-Mixtral-8x7B-DPO",
        description: "Nous Hermes 2",
    },
];

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::Google,
        Provider::OpenRouter,
        Provider::Together,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Google => "google",
            Provider::OpenRouter => "openrouter",
            Provider::Together => "together",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Google => "Google",
            Provider::OpenRouter => "OpenRouter",
            Provider::Together => "Together AI",
        }
    }

    /// Model selected when the operator switches to this provider.
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Google => "gemini-2.0-flash-exp",
            Provider::OpenRouter => "openai/gpt-4o",
            Provider::Together => "meta-llama/Meta-Llama-3.1-8B-Instruct-Turbo",
        }
    }

    pub fn default_api_base(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Google => "https://generativelanguage.googleapis.com/v1beta",
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
            Provider::Together => "https://api.together.xyz/v1",
        }
    }

    pub fn api_key_env(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Google => "GOOGLE_API_KEY",
            Provider::OpenRouter => "OPENROUTER_API_KEY",
            Provider::Together => "TOGETHER_API_KEY",
        }
    }

    pub fn wire(&self) -> ProviderWire {
        match self {
            Provider::Google => ProviderWire::GoogleGenerateContent,
            Provider::OpenAi | Provider::OpenRouter | Provider::Together => {
                ProviderWire::OpenAiChatCompletions
            }
        }
    }

    pub fn model_catalog(&self) -> &'static [ModelInfo] {
        match self {
            Provider::OpenAi => OPENAI_MODELS,
            Provider::Google => GOOGLE_MODELS,
            Provider::OpenRouter => OPENROUTER_MODELS,
            Provider::Together => TOGETHER_MODELS,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unsupported provider '{0}'. Supported providers: openai, google, openrouter, together")]
pub struct ProviderParseError(pub String);

impl FromStr for Provider {
    type Err = ProviderParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "openai" => Ok(Provider::OpenAi),
            "google" | "gemini" => Ok(Provider::Google),
            "openrouter" => Ok(Provider::OpenRouter),
            "together" | "togetherai" | "together-ai" => Ok(Provider::Together),
            _ => Err(ProviderParseError(value.to_string())),
        }
    }
}
