use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    retry::{send_with_retry, RetryPolicy},
    ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient, Message, MessageRole,
    SitaAiError, ToolDefinition,
};

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub api_base: String,
    pub api_key: String,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_budget_ms: u64,
    pub retry_jitter: bool,
}

/// Gemini `generateContent` client.
#[derive(Debug, Clone)]
pub struct GoogleClient {
    client: reqwest::Client,
    config: GoogleConfig,
}

impl GoogleClient {
    pub fn new(config: GoogleConfig) -> Result<Self, SitaAiError> {
        if config.api_key.trim().is_empty() {
            return Err(SitaAiError::MissingApiKey);
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self { client, config })
    }

    fn generate_content_url(&self, model: &str) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.contains(":generateContent") {
            return base.replace("{model}", model);
        }

        format!("{base}/models/{model}:generateContent")
    }
}

#[async_trait]
impl LlmClient for GoogleClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, SitaAiError> {
        let body = build_generate_content_body(&request);
        let url = self.generate_content_url(&request.model);
        let policy = RetryPolicy {
            max_retries: self.config.max_retries,
            budget_ms: self.config.retry_budget_ms,
            jitter: self.config.retry_jitter,
        };
        let raw = send_with_retry(policy, "generateContent", || {
            self.client
                .post(&url)
                .query(&[("key", self.config.api_key.as_str())])
                .json(&body)
        })
        .await?;
        parse_generate_content_response(&raw)
    }
}

fn build_generate_content_body(request: &ChatRequest) -> Value {
    let system = extract_system_text(&request.messages);
    let contents = to_google_contents(&request.messages);

    let mut body = json!({
        "contents": contents,
    });

    if !system.is_empty() {
        body["systemInstruction"] = json!({
            "parts": [{ "text": system }],
        });
    }

    if !request.tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": request.tools.iter().map(to_google_function_declaration).collect::<Vec<_>>()
        }]);
    }

    if request.temperature.is_some() || request.max_tokens.is_some() {
        let mut generation_config = json!({});
        if let Some(temperature) = request.temperature {
            generation_config["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }
        body["generationConfig"] = generation_config;
    }

    body
}

fn extract_system_text(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .map(Message::text_content)
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn to_google_function_declaration(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": sanitize_google_schema(&tool.parameters),
    })
}

// Gemini rejects `additionalProperties` anywhere in a function schema.
fn sanitize_google_schema(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sanitized = serde_json::Map::new();
            for (key, nested) in map {
                if key == "additionalProperties" {
                    continue;
                }
                sanitized.insert(key.clone(), sanitize_google_schema(nested));
            }
            Value::Object(sanitized)
        }
        Value::Array(values) => Value::Array(values.iter().map(sanitize_google_schema).collect()),
        _ => value.clone(),
    }
}

fn to_google_contents(messages: &[Message]) -> Value {
    Value::Array(
        messages
            .iter()
            .filter_map(|message| match message.role {
                MessageRole::System => None,
                MessageRole::User => {
                    let parts = to_google_parts(message, false);
                    (!parts.is_empty()).then(|| json!({ "role": "user", "parts": parts }))
                }
                MessageRole::Assistant => {
                    let parts = to_google_parts(message, true);
                    (!parts.is_empty()).then(|| json!({ "role": "model", "parts": parts }))
                }
                MessageRole::Tool => {
                    let name = message.tool_name.as_deref().unwrap_or("unknown_tool");
                    Some(json!({
                        "role": "user",
                        "parts": [{
                            "functionResponse": {
                                "name": name,
                                "response": {
                                    "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
                                    "content": message.text_content(),
                                    "is_error": message.is_error,
                                }
                            }
                        }]
                    }))
                }
            })
            .collect(),
    )
}

fn to_google_parts(message: &Message, allow_tool_calls: bool) -> Vec<Value> {
    let mut parts = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::Text { text } => {
                if !text.trim().is_empty() {
                    parts.push(json!({ "text": text }));
                }
            }
            ContentBlock::ToolCall {
                name, arguments, ..
            } if allow_tool_calls => {
                parts.push(json!({
                    "functionCall": {
                        "name": name,
                        "args": arguments,
                    }
                }));
            }
            ContentBlock::ToolCall { .. } => {}
        }
    }
    parts
}

fn parse_generate_content_response(raw: &str) -> Result<ChatResponse, SitaAiError> {
    let parsed: GenerateContentResponse = serde_json::from_str(raw)?;
    let candidate = parsed
        .candidates
        .and_then(|candidates| candidates.into_iter().next())
        .ok_or_else(|| {
            SitaAiError::InvalidResponse("response contained no candidates".to_string())
        })?;

    let parts = candidate
        .content
        .and_then(|content| content.parts)
        .unwrap_or_default();
    let mut blocks = Vec::new();

    for (index, part) in parts.into_iter().enumerate() {
        if let Some(text) = part.text {
            if !text.trim().is_empty() {
                blocks.push(ContentBlock::Text { text });
            }
        }

        // Gemini does not assign call ids; derive stable ones from part order.
        if let Some(function_call) = part.function_call {
            blocks.push(ContentBlock::ToolCall {
                id: format!("google_call_{}", index + 1),
                name: function_call.name,
                arguments: function_call.args.unwrap_or_else(|| json!({})),
            });
        }
    }

    let usage = parsed
        .usage_metadata
        .map(|usage| ChatUsage {
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
            total_tokens: usage.total_token_count.unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        message: Message::assistant_blocks(blocks),
        finish_reason: candidate.finish_reason,
        usage,
    })
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<GenerateContentCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GenerateContentUsage>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentCandidate {
    content: Option<GenerateContentContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentContent {
    parts: Option<Vec<GenerateContentPart>>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentPart {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<GenerateContentFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentFunctionCall {
    name: String,
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}
