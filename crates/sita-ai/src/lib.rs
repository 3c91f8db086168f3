//! Completion-service seam for sita: message and tool types, the `LlmClient`
//! trait, the provider catalogue, and HTTP clients for the supported providers.
mod google;
mod openai;
mod provider;
mod retry;
mod types;

pub use google::{GoogleClient, GoogleConfig};
pub use openai::{OpenAiClient, OpenAiConfig};
pub use provider::{ModelInfo, Provider, ProviderParseError, ProviderWire};
pub use types::{
    ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient, Message, MessageRole,
    SitaAiError, ToolCall, ToolDefinition,
};
