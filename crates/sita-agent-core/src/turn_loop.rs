//! Bounded orchestration loop for AGENT-mode turns.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sita_ai::{ChatRequest, ChatUsage, LlmClient, Message, ToolCall};
use thiserror::Error;

use crate::{CancellationToken, ToolInvocation, ToolInvokeError, ToolRegistry};

const DEFAULT_MAX_ROUNDS: usize = 8;
const DEFAULT_MAX_PARALLEL_TOOL_CALLS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub model: String,
    pub system_prompt: String,
    /// Tool round trips allowed per turn; completion calls never exceed this plus one.
    pub max_rounds: usize,
    pub max_parallel_tool_calls: usize,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a helpful system administration assistant.".to_string(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            max_parallel_tool_calls: DEFAULT_MAX_PARALLEL_TOOL_CALLS,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.model.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "model must not be empty".to_string(),
            ));
        }
        if self.max_parallel_tool_calls == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "max_parallel_tool_calls must be greater than 0".to_string(),
            ));
        }
        if let Some(temperature) = self.temperature {
            if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "temperature {temperature} is outside 0.0..=2.0"
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(OrchestratorError::InvalidConfig(
                "max_tokens must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Misuse of the orchestrator itself. Turn outcomes are never reported this way.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("invalid orchestrator configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    AwaitingResponse,
    ToolRequested,
    ExecutingTools,
    Final,
}

/// Terminal status of a turn, set exactly once when the turn is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStatus {
    Completed,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Completed => "COMPLETED",
            TurnStatus::Failed => "FAILED",
            TurnStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Everything the loop produced for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// True when the turn was cut short (round bound or cancellation mid-execution).
    pub truncated: bool,
    pub notice: Option<String>,
    pub answer: Option<String>,
    pub error: Option<String>,
    /// Completion-service calls made.
    pub rounds: usize,
    /// Invocations in request order.
    pub invocations: Vec<ToolInvocation>,
    pub usage: ChatUsage,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    StateChanged {
        round: usize,
        from: LoopState,
        to: LoopState,
    },
    RoundCompleted {
        round: usize,
        tool_calls: usize,
        usage: ChatUsage,
    },
    ToolExecutionStart {
        round: usize,
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolExecutionEnd {
        invocation: ToolInvocation,
    },
    TurnFinished {
        status: TurnStatus,
        rounds: usize,
        truncated: bool,
    },
}

type EventHandler = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Drives one AGENT turn against the completion service and the tool registry.
pub struct Orchestrator {
    client: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    config: OrchestratorConfig,
    handlers: Vec<EventHandler>,
}

struct TurnProgress {
    state: LoopState,
    round: usize,
    invocations: Vec<ToolInvocation>,
    usage: ChatUsage,
    answer: Option<String>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            registry,
            config,
            handlers: Vec::new(),
        }
    }

    /// Like [`Orchestrator::new`] but rejects an unusable configuration.
    pub fn try_new(
        client: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        Ok(Self::new(client, registry, config))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Adds an event subscriber; a panicking subscriber never breaks the loop.
    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
    }

    /// Resolves `payload` into a finalized outcome.
    ///
    /// `history` is the bounded recent conversation replayed before the payload.
    /// The loop ends on a final answer, on the round bound, or on cancellation,
    /// whichever comes first; it never returns without a terminal status.
    pub async fn run_turn(
        &self,
        turn_seq: u64,
        payload: &str,
        history: &[Message],
        cancellation: &CancellationToken,
    ) -> TurnOutcome {
        let mut messages = Vec::with_capacity(history.len().saturating_add(2));
        if !self.config.system_prompt.trim().is_empty() {
            messages.push(Message::system(self.config.system_prompt.clone()));
        }
        messages.extend(history.iter().cloned());
        messages.push(Message::user(payload));

        let max_rounds = self.config.max_rounds;
        let mut progress = TurnProgress {
            state: LoopState::AwaitingResponse,
            round: 0,
            invocations: Vec::new(),
            usage: ChatUsage::default(),
            answer: None,
        };
        let mut pending_calls: Vec<ToolCall> = Vec::new();

        loop {
            match progress.state {
                LoopState::AwaitingResponse => {
                    progress.round = progress.round.saturating_add(1);
                    if cancellation.is_cancelled() {
                        return self.finish_cancelled(progress);
                    }
                    let request = ChatRequest {
                        model: self.config.model.clone(),
                        messages: messages.clone(),
                        tools: self.registry.definitions(),
                        max_tokens: self.config.max_tokens,
                        temperature: self.config.temperature,
                    };
                    tracing::debug!(turn_seq, round = progress.round, "requesting completion");
                    let response = tokio::select! {
                        _ = cancellation.cancelled() => {
                            return self.finish_cancelled(progress);
                        }
                        response = self.client.complete(request) => response,
                    };
                    let response = match response {
                        Ok(response) => response,
                        Err(error) => {
                            tracing::warn!(turn_seq, round = progress.round, %error, "completion service unavailable");
                            return self.finish(
                                progress,
                                TurnStatus::Failed,
                                false,
                                None,
                                Some(format!("completion service unavailable: {error}")),
                            );
                        }
                    };

                    progress.usage.accumulate(&response.usage);
                    let calls = response.message.tool_calls();
                    let text = response.message.text_content();
                    if !text.trim().is_empty() {
                        progress.answer = Some(text);
                    }
                    self.emit(&AgentEvent::RoundCompleted {
                        round: progress.round,
                        tool_calls: calls.len(),
                        usage: response.usage.clone(),
                    });
                    messages.push(response.message);

                    if calls.is_empty() {
                        self.transition(&mut progress, LoopState::Final);
                    } else {
                        pending_calls = calls;
                        self.transition(&mut progress, LoopState::ToolRequested);
                    }
                }
                LoopState::ToolRequested => {
                    if progress.round > max_rounds {
                        tracing::warn!(turn_seq, max_rounds, "round bound reached; forcing final");
                        let notice = format!(
                            "stopped after {max_rounds} tool rounds; {} further tool request(s) were not executed",
                            pending_calls.len()
                        );
                        return self.finish(progress, TurnStatus::Completed, true, Some(notice), None);
                    }
                    if cancellation.is_cancelled() {
                        return self.finish(
                            progress,
                            TurnStatus::Completed,
                            true,
                            Some("cancelled by operator before tool execution".to_string()),
                            None,
                        );
                    }
                    self.transition(&mut progress, LoopState::ExecutingTools);
                }
                LoopState::ExecutingTools => {
                    let calls = std::mem::take(&mut pending_calls);
                    let executed = self
                        .execute_round(
                            turn_seq,
                            progress.round,
                            progress.invocations.len(),
                            calls,
                            cancellation,
                        )
                        .await;
                    for invocation in executed {
                        messages.push(Message::tool_result(
                            invocation.call_id.clone(),
                            invocation.tool_name.clone(),
                            invocation.feedback_text(),
                            !invocation.is_success(),
                        ));
                        progress.invocations.push(invocation);
                    }
                    if cancellation.is_cancelled() {
                        return self.finish(
                            progress,
                            TurnStatus::Completed,
                            true,
                            Some("cancelled by operator during tool execution".to_string()),
                            None,
                        );
                    }
                    self.transition(&mut progress, LoopState::AwaitingResponse);
                }
                LoopState::Final => {
                    return self.finish(progress, TurnStatus::Completed, false, None, None);
                }
            }
        }
    }

    async fn execute_round(
        &self,
        turn_seq: u64,
        round: usize,
        first_index: usize,
        calls: Vec<ToolCall>,
        cancellation: &CancellationToken,
    ) -> Vec<ToolInvocation> {
        let max_parallel = self.config.max_parallel_tool_calls.max(1);
        let mut executed = Vec::with_capacity(calls.len());
        let indexed: Vec<(usize, ToolCall)> = calls
            .into_iter()
            .enumerate()
            .map(|(offset, call)| (first_index.saturating_add(offset), call))
            .collect();

        for chunk in indexed.chunks(max_parallel) {
            let mut pending = Vec::with_capacity(chunk.len());
            for (request_index, call) in chunk.iter().cloned() {
                self.emit(&AgentEvent::ToolExecutionStart {
                    round,
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
                let registry = Arc::clone(&self.registry);
                let token = cancellation.clone();
                let fallback = call.clone();
                let handle = tokio::spawn(async move {
                    registry
                        .invoke_recorded(turn_seq, round, request_index, call, Some(&token))
                        .await
                });
                pending.push((request_index, fallback, handle));
            }

            // Joined in request order so the record is independent of completion timing.
            for (request_index, call, handle) in pending {
                let invocation = match handle.await {
                    Ok(invocation) => invocation,
                    Err(error) => failed_task_invocation(turn_seq, round, request_index, call, &error),
                };
                self.emit(&AgentEvent::ToolExecutionEnd {
                    invocation: invocation.clone(),
                });
                executed.push(invocation);
            }
        }
        executed
    }

    fn transition(&self, progress: &mut TurnProgress, to: LoopState) {
        let from = progress.state;
        progress.state = to;
        self.emit(&AgentEvent::StateChanged {
            round: progress.round,
            from,
            to,
        });
    }

    fn finish_cancelled(&self, progress: TurnProgress) -> TurnOutcome {
        tracing::info!(round = progress.round, "turn cancelled while awaiting completion");
        self.finish(
            progress,
            TurnStatus::Cancelled,
            false,
            Some("cancelled by operator while waiting for the completion service".to_string()),
            None,
        )
    }

    fn finish(
        &self,
        mut progress: TurnProgress,
        status: TurnStatus,
        truncated: bool,
        notice: Option<String>,
        error: Option<String>,
    ) -> TurnOutcome {
        if progress.state != LoopState::Final {
            self.transition(&mut progress, LoopState::Final);
        }
        self.emit(&AgentEvent::TurnFinished {
            status,
            rounds: progress.round,
            truncated,
        });
        TurnOutcome {
            status,
            truncated,
            notice,
            answer: progress.answer,
            error,
            rounds: progress.round,
            invocations: progress.invocations,
            usage: progress.usage,
        }
    }

    fn emit(&self, event: &AgentEvent) {
        for handler in &self.handlers {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
        }
    }
}

fn failed_task_invocation(
    turn_seq: u64,
    round: usize,
    request_index: usize,
    call: ToolCall,
    error: &tokio::task::JoinError,
) -> ToolInvocation {
    let now = sita_core::current_unix_timestamp_ms();
    ToolInvocation {
        turn_seq,
        round,
        request_index,
        call_id: call.id,
        tool_name: call.name.clone(),
        arguments: call.arguments,
        started_at_ms: now,
        finished_at_ms: now,
        outcome: crate::InvocationOutcome::Failed {
            error: ToolInvokeError::ExecutionError {
                name: call.name,
                message: format!("execution task failed: {error}"),
                detail: None,
            },
        },
    }
}

#[cfg(test)]
mod tests;
