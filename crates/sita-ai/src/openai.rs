use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    retry::{send_with_retry, RetryPolicy},
    ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient, Message, MessageRole,
    SitaAiError, ToolDefinition,
};

/// Settings for any endpoint speaking the OpenAI chat-completions format
/// (OpenAI itself, OpenRouter, Together).
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_base: String,
    pub api_key: String,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_budget_ms: u64,
    pub retry_jitter: bool,
    pub extra_headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, SitaAiError> {
        if config.api_key.trim().is_empty() {
            return Err(SitaAiError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|e| SitaAiError::InvalidResponse(format!("invalid API key header: {e}")))?,
        );
        for (name, value) in &config.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                SitaAiError::InvalidResponse(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                SitaAiError::InvalidResponse(format!("invalid header value for '{name}': {e}"))
            })?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self { client, config })
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.max_retries,
            budget_ms: self.config.retry_budget_ms,
            jitter: self.config.retry_jitter,
        }
    }

    fn chat_completions_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }

        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, SitaAiError> {
        let body = build_chat_request_body(&request)?;
        let url = self.chat_completions_url();
        let raw = send_with_retry(self.retry_policy(), "chat completion", || {
            self.client.post(&url).json(&body)
        })
        .await?;
        parse_chat_response(&raw)
    }
}

fn build_chat_request_body(request: &ChatRequest) -> Result<Value, SitaAiError> {
    let messages = to_openai_messages(&request.messages)?;
    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });

    if !request.tools.is_empty() {
        body["tools"] = to_openai_tools(&request.tools);
    }

    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }

    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }

    Ok(body)
}

fn to_openai_tools(tools: &[ToolDefinition]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect(),
    )
}

fn to_openai_messages(messages: &[Message]) -> Result<Vec<Value>, SitaAiError> {
    let mut serialized = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            MessageRole::System => serialized.push(json!({
                "role": "system",
                "content": message.text_content(),
            })),
            MessageRole::User => serialized.push(json!({
                "role": "user",
                "content": message.text_content(),
            })),
            MessageRole::Assistant => {
                let tool_calls: Vec<Value> = message
                    .tool_calls()
                    .into_iter()
                    .map(|call| {
                        // Arguments that arrived as a raw string are replayed verbatim.
                        let arguments = match call.arguments {
                            Value::String(raw) => raw,
                            other => other.to_string(),
                        };
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": arguments,
                            }
                        })
                    })
                    .collect();

                let text = message.text_content();
                let content = if text.trim().is_empty() && !tool_calls.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };

                let mut assistant = json!({
                    "role": "assistant",
                    "content": content,
                });
                if !tool_calls.is_empty() {
                    assistant["tool_calls"] = Value::Array(tool_calls);
                }
                serialized.push(assistant);
            }
            MessageRole::Tool => {
                let Some(tool_call_id) = message.tool_call_id.as_deref() else {
                    return Err(SitaAiError::InvalidResponse(
                        "tool message is missing tool_call_id".to_string(),
                    ));
                };

                let mut tool_message = json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": message.text_content(),
                });

                if let Some(name) = &message.tool_name {
                    tool_message["name"] = Value::String(name.clone());
                }

                serialized.push(tool_message);
            }
        }
    }

    Ok(serialized)
}

fn parse_chat_response(raw: &str) -> Result<ChatResponse, SitaAiError> {
    let parsed: OpenAiChatResponse = serde_json::from_str(raw)?;
    let choice =
        parsed.choices.into_iter().next().ok_or_else(|| {
            SitaAiError::InvalidResponse("response contained no choices".to_string())
        })?;

    let text = extract_text(&choice.message.content);
    let mut content = Vec::new();
    if !text.trim().is_empty() {
        content.push(ContentBlock::Text { text });
    }

    for tool_call in choice.message.tool_calls.unwrap_or_default() {
        if tool_call.call_type != "function" {
            continue;
        }

        let arguments = match serde_json::from_str::<Value>(&tool_call.function.arguments) {
            Ok(value) => value,
            Err(_) => Value::String(tool_call.function.arguments),
        };

        content.push(ContentBlock::ToolCall {
            id: tool_call.id,
            name: tool_call.function.name,
            arguments,
        });
    }

    let usage = parsed
        .usage
        .map(|usage| ChatUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        message: Message::assistant_blocks(content),
        finish_reason: choice.finish_reason,
        usage,
    })
}

fn extract_text(content: &Option<Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.as_object())
            .filter(|obj| obj.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|obj| obj.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        Some(other) => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<Value>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{build_chat_request_body, parse_chat_response};
    use crate::{ChatRequest, ContentBlock, Message, ToolDefinition};

    #[test]
    fn serializes_assistant_tool_calls_and_tool_results() {
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![
                Message::system("You are a sysadmin"),
                Message::user("check disk"),
                Message::assistant_blocks(vec![ContentBlock::ToolCall {
                    id: "call_1".to_string(),
                    name: "shell".to_string(),
                    arguments: json!({ "command": "df -h" }),
                }]),
                Message::tool_result("call_1", "shell", "{\"exit_code\":0}", false),
            ],
            tools: vec![ToolDefinition {
                name: "shell".to_string(),
                description: "Run a shell command".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": { "command": { "type": "string" } },
                    "required": ["command"]
                }),
            }],
            max_tokens: Some(512),
            temperature: Some(0.7),
        };

        let body = build_chat_request_body(&request).expect("request body must serialize");
        assert_eq!(
            body["messages"][2]["tool_calls"][0]["function"]["name"],
            "shell"
        );
        assert_eq!(body["messages"][2]["content"], Value::Null);
        assert_eq!(body["messages"][3]["role"], "tool");
        assert_eq!(body["messages"][3]["name"], "shell");
        assert_eq!(body["tools"][0]["function"]["name"], "shell");
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn tool_message_without_call_id_is_rejected() {
        let mut orphan = Message::tool_result("call_1", "shell", "out", false);
        orphan.tool_call_id = None;
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![orphan],
            tools: vec![],
            max_tokens: None,
            temperature: None,
        };
        let error = build_chat_request_body(&request).expect_err("must reject");
        assert!(error.to_string().contains("tool_call_id"));
    }

    #[test]
    fn parses_tool_calls_from_response() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "shell",
                            "arguments": "{\"command\":\"df -h\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 4,
                "total_tokens": 14
            }
        }"#;

        let response = parse_chat_response(raw).expect("response must parse");
        let calls = response.message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({ "command": "df -h" }));
        assert_eq!(response.usage.total_tokens, 14);
        assert_eq!(response.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn malformed_tool_arguments_are_kept_as_raw_string() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "shell", "arguments": "{not json" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;

        let response = parse_chat_response(raw).expect("response must parse");
        assert_eq!(
            response.message.tool_calls()[0].arguments,
            Value::String("{not json".to_string())
        );
    }

    #[test]
    fn empty_choices_is_invalid_response() {
        let error = parse_chat_response(r#"{"choices":[]}"#).expect_err("no choices");
        assert!(error.to_string().contains("no choices"));
    }
}
