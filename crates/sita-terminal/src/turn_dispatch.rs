//! Routes classified input to its execution path and records the turn.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde_json::{json, Value};
use sita_agent_core::{
    CancellationToken, InvocationOutcome, Orchestrator, OrchestratorConfig, ToolInvocation,
    ToolInvokeError, TurnOutcome, TurnStatus,
};
use sita_ai::{ChatUsage, ToolCall};
use sita_core::current_unix_timestamp_ms;
use sita_session::{Turn, TurnMode};
use sita_tools::{quick_query_help, resolve_quick_query};

use crate::input_classifier::{classify_input, ClassifiedInput};
use crate::system_prompt::compose_system_prompt;
use crate::{InputOutcome, TerminalRuntime};

const SHELL_TOOL: &str = "shell";

impl TerminalRuntime {
    /// Classifies `input`, runs it, and appends the finalized turn to the session.
    ///
    /// Control commands run synchronously and create no turn. Every turn that
    /// is created reaches a terminal status before it is persisted.
    pub async fn handle_input(
        &mut self,
        input: &str,
        cancellation: &CancellationToken,
    ) -> Result<InputOutcome> {
        match classify_input(input) {
            ClassifiedInput::Control(command) => {
                let output = self.execute_control(command)?;
                if output.text.is_empty() && !output.clear_screen && !output.exit {
                    return Ok(InputOutcome::Noop);
                }
                Ok(InputOutcome::Control(output))
            }
            ClassifiedInput::Turn { mode, payload } => {
                let turn = self.run_turn(input, mode, &payload, cancellation).await?;
                Ok(InputOutcome::Turn(Box::new(turn)))
            }
        }
    }

    async fn run_turn(
        &mut self,
        input: &str,
        mode: TurnMode,
        payload: &str,
        cancellation: &CancellationToken,
    ) -> Result<Turn> {
        let seq = self.session.next_seq();
        let started_at = Utc::now();
        tracing::info!(session_id = %self.session.id, seq, mode = mode.as_str(), "turn started");

        let outcome = match mode {
            TurnMode::Shell => {
                let call = ToolCall {
                    id: format!("shell-{seq}"),
                    name: SHELL_TOOL.to_string(),
                    arguments: json!({ "command": payload }),
                };
                self.run_direct(seq, call, cancellation).await
            }
            TurnMode::Query => match resolve_quick_query(payload) {
                Some(tool) => {
                    let call = ToolCall {
                        id: format!("query-{seq}"),
                        name: tool.to_string(),
                        arguments: json!({}),
                    };
                    self.run_direct(seq, call, cancellation).await
                }
                None => unknown_query_outcome(payload),
            },
            TurnMode::Agent => self.run_agent(seq, payload, cancellation).await,
        };

        let turn = build_turn(seq, input, mode, payload, started_at, outcome);
        self.store
            .append(&mut self.session, turn.clone())
            .with_context(|| format!("failed to record turn {seq} in session {}", self.session.id))?;
        tracing::info!(
            session_id = %self.session.id,
            seq,
            status = turn.status.as_str(),
            invocations = turn.invocations.len(),
            rounds = turn.rounds,
            "turn finished"
        );
        Ok(turn)
    }

    /// SHELL and QUERY turns: exactly one registry invocation, no completion call.
    async fn run_direct(
        &self,
        seq: u64,
        call: ToolCall,
        cancellation: &CancellationToken,
    ) -> TurnOutcome {
        let fallback = call.clone();
        let started_at_ms = current_unix_timestamp_ms();
        let registry = Arc::clone(&self.registry);
        // Cancellation is owned here so an interrupted direct turn always ends truncated.
        tokio::select! {
            invocation = registry.invoke_recorded(seq, 0, 0, call, None) => {
                direct_outcome(invocation)
            }
            _ = cancellation.cancelled() => {
                // Dropping the invocation future kills its child process.
                let invocation = abandoned_invocation(seq, fallback, started_at_ms);
                TurnOutcome {
                    status: TurnStatus::Completed,
                    truncated: true,
                    notice: Some("cancelled by operator; the command was abandoned".to_string()),
                    answer: None,
                    error: None,
                    rounds: 0,
                    invocations: vec![invocation],
                    usage: ChatUsage::default(),
                }
            }
        }
    }

    async fn run_agent(
        &mut self,
        seq: u64,
        payload: &str,
        cancellation: &CancellationToken,
    ) -> TurnOutcome {
        let client = match self.completion_client() {
            Ok(client) => client,
            Err(error) => {
                tracing::warn!(error = %error, "completion client unavailable");
                return failed_outcome(format!("completion service unavailable: {error:#}"));
            }
        };
        let config = self.orchestrator_config();
        let mut orchestrator =
            match Orchestrator::try_new(client, Arc::clone(&self.registry), config) {
                Ok(orchestrator) => orchestrator,
                Err(error) => return failed_outcome(error.to_string()),
            };
        if self.configuration.show_tool_calls {
            if let Some(sink) = self.event_sink.clone() {
                orchestrator.subscribe(move |event| sink(event));
            }
        }
        let history = self.session.recent_context(self.limits.history_turns);
        orchestrator
            .run_turn(seq, payload, &history, cancellation)
            .await
    }

    pub(crate) fn orchestrator_config(&self) -> OrchestratorConfig {
        let system_prompt = compose_system_prompt(
            &self.platform,
            self.configuration.provider,
            &self.configuration.model,
            &self.registry.names(),
            Local::now(),
        );
        OrchestratorConfig {
            model: self.configuration.model.clone(),
            system_prompt,
            max_rounds: self.limits.max_rounds,
            max_parallel_tool_calls: self.limits.max_parallel_tool_calls,
            temperature: Some(self.configuration.temperature),
            max_tokens: Some(self.configuration.max_tokens),
        }
    }
}

fn direct_outcome(invocation: ToolInvocation) -> TurnOutcome {
    let (status, error) = match invocation.error() {
        None => (TurnStatus::Completed, None),
        Some(error) => (TurnStatus::Failed, Some(error.to_string())),
    };
    TurnOutcome {
        status,
        truncated: false,
        notice: None,
        answer: None,
        error,
        rounds: 0,
        invocations: vec![invocation],
        usage: ChatUsage::default(),
    }
}

fn abandoned_invocation(seq: u64, call: ToolCall, started_at_ms: u64) -> ToolInvocation {
    ToolInvocation {
        turn_seq: seq,
        round: 0,
        request_index: 0,
        call_id: call.id,
        tool_name: call.name.clone(),
        arguments: call.arguments,
        started_at_ms,
        finished_at_ms: current_unix_timestamp_ms(),
        outcome: InvocationOutcome::Failed {
            error: ToolInvokeError::ExecutionError {
                name: call.name,
                message: "abandoned after operator cancellation".to_string(),
                detail: None,
            },
        },
    }
}

fn unknown_query_outcome(payload: &str) -> TurnOutcome {
    let shown = if payload.is_empty() { "<empty>" } else { payload };
    failed_outcome(format!(
        "unknown quick query '{shown}'. Available queries:\n{}",
        quick_query_help()
    ))
}

fn failed_outcome(error: String) -> TurnOutcome {
    TurnOutcome {
        status: TurnStatus::Failed,
        truncated: false,
        notice: None,
        answer: None,
        error: Some(error),
        rounds: 0,
        invocations: Vec::new(),
        usage: ChatUsage::default(),
    }
}

pub(crate) fn build_turn(
    seq: u64,
    input: &str,
    mode: TurnMode,
    payload: &str,
    started_at: DateTime<Utc>,
    outcome: TurnOutcome,
) -> Turn {
    Turn {
        seq,
        input: input.trim_end_matches(['\r', '\n']).to_string(),
        mode,
        payload: payload.to_string(),
        started_at,
        finished_at: Utc::now(),
        status: outcome.status,
        truncated: outcome.truncated,
        notice: outcome.notice,
        answer: outcome.answer,
        error: outcome.error,
        rounds: outcome.rounds,
        invocations: outcome.invocations,
        usage: outcome.usage,
    }
}

/// Primary text output of a direct invocation, used for display.
pub fn invocation_output(invocation: &ToolInvocation) -> Option<String> {
    let value = match &invocation.outcome {
        InvocationOutcome::Succeeded { result } => result,
        InvocationOutcome::Failed {
            error: ToolInvokeError::ExecutionError {
                detail: Some(detail),
                ..
            },
        } => detail,
        InvocationOutcome::Failed { .. } => return None,
    };
    if let Some(report) = value.get("report").and_then(Value::as_str) {
        return Some(report.to_string());
    }
    let stdout = value.get("stdout").and_then(Value::as_str).unwrap_or_default();
    let stderr = value.get("stderr").and_then(Value::as_str).unwrap_or_default();
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => value
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string),
        (false, true) => Some(stdout.to_string()),
        (true, false) => Some(stderr.to_string()),
        (false, false) => Some(format!("{stdout}\n{stderr}")),
    }
}
