//! Tool contracts, the registry that enforces them, and invocation records.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sita_ai::{ToolCall, ToolDefinition};
use sita_core::current_unix_timestamp_ms;
use thiserror::Error;

use crate::CancellationToken;

/// Static per-tool metadata, registered once and immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolContract {
    pub name: String,
    pub description: String,
    /// JSON schema every argument payload must satisfy before execution.
    pub parameters: Value,
    /// JSON schema every successful result must satisfy.
    pub result_schema: Value,
    pub max_duration: Duration,
}

impl ToolContract {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Raw outcome reported by a tool implementation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub content: Value,
    pub is_error: bool,
}

impl ToolExecutionResult {
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(content: Value) -> Self {
        Self {
            content,
            is_error: true,
        }
    }

    /// Converts the payload to text for insertion into a tool message.
    pub fn as_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// A capability the registry can invoke.
///
/// Implementations own their side effects. A failure is reported by returning
/// [`ToolExecutionResult::error`]; by convention the payload carries an
/// `"error"` string plus any diagnostic fields (exit code, stderr, ...).
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn contract(&self) -> ToolContract;
    async fn execute(&self, arguments: Value) -> ToolExecutionResult;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
    #[error("tool '{name}' declares an invalid {schema} schema: {reason}")]
    InvalidContract {
        name: String,
        schema: &'static str,
        reason: String,
    },
}

/// Why a single invocation did not produce a result.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolInvokeError {
    #[error("tool '{name}' is not registered")]
    NotFound { name: String },
    #[error("invalid arguments for '{name}': {reason}")]
    SchemaViolation { name: String, reason: String },
    #[error("tool '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },
    #[error("tool '{name}' failed: {message}")]
    ExecutionError {
        name: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    #[error("tool '{name}' cancelled before execution")]
    Cancelled { name: String },
}

impl ToolInvokeError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolInvokeError::NotFound { .. } => "not_found",
            ToolInvokeError::SchemaViolation { .. } => "schema_violation",
            ToolInvokeError::Timeout { .. } => "timeout",
            ToolInvokeError::ExecutionError { .. } => "execution_error",
            ToolInvokeError::Cancelled { .. } => "cancelled",
        }
    }

    /// Payload fed back to the completion service in place of a result.
    pub fn feedback(&self) -> Value {
        let mut payload = json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let ToolInvokeError::ExecutionError {
            detail: Some(detail),
            ..
        } = self
        {
            payload["detail"] = detail.clone();
        }
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Succeeded { result: Value },
    Failed { error: ToolInvokeError },
}

/// One recorded execution attempt of a named tool within a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Sequence number of the owning turn.
    pub turn_seq: u64,
    /// Completion round that requested the call (0 for direct SHELL/QUERY turns).
    pub round: usize,
    /// Stable ordering key: position in request order across the whole turn.
    pub request_index: usize,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub outcome: InvocationOutcome,
}

impl ToolInvocation {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Succeeded { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            InvocationOutcome::Succeeded { result } => Some(result),
            InvocationOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ToolInvokeError> {
        match &self.outcome {
            InvocationOutcome::Succeeded { .. } => None,
            InvocationOutcome::Failed { error } => Some(error),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.finished_at_ms.saturating_sub(self.started_at_ms)
    }

    /// Text handed back to the completion service for this call.
    pub fn feedback_text(&self) -> String {
        let payload = match &self.outcome {
            InvocationOutcome::Succeeded { result } => result.clone(),
            InvocationOutcome::Failed { error } => error.feedback(),
        };
        ToolExecutionResult::ok(payload).as_text()
    }
}

struct RegisteredTool {
    contract: ToolContract,
    tool: Arc<dyn AgentTool>,
}

/// Name-keyed set of tool contracts; the single gate through which tools run.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool under its contract name; duplicates are rejected.
    pub fn register(&mut self, tool: Arc<dyn AgentTool>) -> Result<(), RegistryError> {
        let contract = tool.contract();
        if self.tools.contains_key(&contract.name) {
            return Err(RegistryError::DuplicateTool(contract.name));
        }
        for (schema, value) in [
            ("argument", &contract.parameters),
            ("result", &contract.result_schema),
        ] {
            validator_for(value).map_err(|error| RegistryError::InvalidContract {
                name: contract.name.clone(),
                schema,
                reason: error.to_string(),
            })?;
        }
        tracing::debug!(tool = %contract.name, "registered tool");
        self.tools.insert(
            contract.name.clone(),
            RegisteredTool { contract, tool },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn contract(&self, name: &str) -> Option<&ToolContract> {
        self.tools.get(name).map(|registered| &registered.contract)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declarations for the completion service, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|registered| registered.contract.definition())
            .collect()
    }

    /// Checks `arguments` against the named contract without executing anything.
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<(), ToolInvokeError> {
        let registered = self
            .tools
            .get(name)
            .ok_or_else(|| ToolInvokeError::NotFound {
                name: name.to_string(),
            })?;
        check_schema(&registered.contract.parameters, arguments).map_err(|reason| {
            ToolInvokeError::SchemaViolation {
                name: name.to_string(),
                reason,
            }
        })
    }

    /// Validates and runs one tool under its contract's maximum duration.
    ///
    /// On `Timeout` the invocation is abandoned: its future is dropped, which
    /// kills child processes spawned with `kill_on_drop`, but side effects that
    /// already happened (files written, commands run) are not rolled back.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolInvokeError> {
        self.invoke_with_cancellation(name, arguments, None).await
    }

    /// Like [`ToolRegistry::invoke`], refusing to start once `token` is cancelled.
    ///
    /// An invocation already running is left to complete or hit its timeout.
    pub async fn invoke_with_cancellation(
        &self,
        name: &str,
        arguments: Value,
        token: Option<&CancellationToken>,
    ) -> Result<Value, ToolInvokeError> {
        let registered = self
            .tools
            .get(name)
            .ok_or_else(|| ToolInvokeError::NotFound {
                name: name.to_string(),
            })?;
        let contract = &registered.contract;
        check_schema(&contract.parameters, &arguments).map_err(|reason| {
            ToolInvokeError::SchemaViolation {
                name: name.to_string(),
                reason,
            }
        })?;
        if token.map(CancellationToken::is_cancelled).unwrap_or(false) {
            return Err(ToolInvokeError::Cancelled {
                name: name.to_string(),
            });
        }

        let result =
            match tokio::time::timeout(contract.max_duration, registered.tool.execute(arguments))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    return Err(ToolInvokeError::Timeout {
                        name: name.to_string(),
                        timeout_ms: duration_ms(contract.max_duration),
                    })
                }
            };

        if result.is_error {
            return Err(ToolInvokeError::ExecutionError {
                name: name.to_string(),
                message: error_message(&result.content),
                detail: Some(result.content),
            });
        }

        check_schema(&contract.result_schema, &result.content).map_err(|reason| {
            ToolInvokeError::ExecutionError {
                name: name.to_string(),
                message: format!("result does not match declared schema: {reason}"),
                detail: Some(result.content.clone()),
            }
        })?;
        Ok(result.content)
    }

    /// Runs `call` and captures the attempt as a [`ToolInvocation`], success or not.
    pub async fn invoke_recorded(
        &self,
        turn_seq: u64,
        round: usize,
        request_index: usize,
        call: ToolCall,
        token: Option<&CancellationToken>,
    ) -> ToolInvocation {
        let started_at_ms = current_unix_timestamp_ms();
        let outcome = match self
            .invoke_with_cancellation(&call.name, call.arguments.clone(), token)
            .await
        {
            Ok(result) => InvocationOutcome::Succeeded { result },
            Err(error) => InvocationOutcome::Failed { error },
        };
        let finished_at_ms = current_unix_timestamp_ms();
        match &outcome {
            InvocationOutcome::Succeeded { .. } => tracing::info!(
                tool = %call.name,
                turn_seq,
                round,
                elapsed_ms = finished_at_ms.saturating_sub(started_at_ms),
                "tool invocation succeeded"
            ),
            InvocationOutcome::Failed { error } => tracing::warn!(
                tool = %call.name,
                turn_seq,
                round,
                kind = error.kind(),
                %error,
                "tool invocation failed"
            ),
        }
        ToolInvocation {
            turn_seq,
            round,
            request_index,
            call_id: call.id,
            tool_name: call.name,
            arguments: call.arguments,
            started_at_ms,
            finished_at_ms,
            outcome,
        }
    }
}

fn check_schema(schema: &Value, instance: &Value) -> Result<(), String> {
    let validator = validator_for(schema).map_err(|error| format!("invalid JSON schema: {error}"))?;
    let mut errors = validator.iter_errors(instance);
    if let Some(first) = errors.next() {
        return Err(first.to_string());
    }
    Ok(())
}

fn error_message(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| content.to_string()),
        other => other.to_string(),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
