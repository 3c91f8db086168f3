use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::{json, Value};
use sita_ai::{
    ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient, Message, MessageRole,
    SitaAiError,
};
use tokio::sync::Mutex as AsyncMutex;

use super::{
    AgentEvent, LoopState, Orchestrator, OrchestratorConfig, OrchestratorError, TurnStatus,
};
use crate::{
    AgentTool, CancellationToken, InvocationOutcome, ToolContract, ToolExecutionResult,
    ToolRegistry,
};

struct ScriptedClient {
    responses: AsyncMutex<VecDeque<ChatResponse>>,
    requests: AsyncMutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: AsyncMutex::new(VecDeque::from(responses)),
            requests: AsyncMutex::new(Vec::new()),
        }
    }

    async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, SitaAiError> {
        self.requests.lock().await.push(request);
        self.responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| SitaAiError::InvalidResponse("scripted response queue exhausted".into()))
    }
}

/// Requests one more shell call on every round, forever.
struct RelentlessClient {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for RelentlessClient {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, SitaAiError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let call_id = format!("call_{call}");
        Ok(tool_call_response(&[(
            call_id.as_str(),
            "shell",
            json!({ "command": "uptime" }),
        )]))
    }
}

/// Never answers; only cancellation ends a request.
struct StalledClient;

#[async_trait]
impl LlmClient for StalledClient {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, SitaAiError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Err(SitaAiError::InvalidResponse("unreachable".to_string()))
    }
}

struct RecordingShellTool {
    executions: Arc<AtomicUsize>,
    delay_for: fn(&str) -> Duration,
}

#[async_trait]
impl AgentTool for RecordingShellTool {
    fn contract(&self) -> ToolContract {
        ToolContract {
            name: "shell".to_string(),
            description: "Run a shell command".to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"],
                "additionalProperties": false
            }),
            result_schema: json!({ "type": "object", "required": ["stdout"] }),
            max_duration: Duration::from_secs(2),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let command = arguments["command"].as_str().unwrap_or_default().to_string();
        tokio::time::sleep((self.delay_for)(&command)).await;
        ToolExecutionResult::ok(json!({ "stdout": format!("ran {command}") }))
    }
}

fn no_delay(_command: &str) -> Duration {
    Duration::ZERO
}

fn registry(executions: Arc<AtomicUsize>, delay_for: fn(&str) -> Duration) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(RecordingShellTool {
            executions,
            delay_for,
        }))
        .expect("register shell");
    Arc::new(registry)
}

fn tool_call_response(calls: &[(&str, &str, Value)]) -> ChatResponse {
    ChatResponse {
        message: Message::assistant_blocks(
            calls
                .iter()
                .map(|(id, name, arguments)| ContentBlock::ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: arguments.clone(),
                })
                .collect(),
        ),
        finish_reason: Some("tool_calls".to_string()),
        usage: ChatUsage {
            input_tokens: 10,
            output_tokens: 2,
            total_tokens: 12,
        },
    }
}

fn text_response(text: &str) -> ChatResponse {
    ChatResponse {
        message: Message::assistant_text(text),
        finish_reason: Some("stop".to_string()),
        usage: ChatUsage {
            input_tokens: 20,
            output_tokens: 5,
            total_tokens: 25,
        },
    }
}

fn config(max_rounds: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        max_rounds,
        ..OrchestratorConfig::default()
    }
}

#[tokio::test]
async fn final_answer_without_tools_takes_one_round() {
    let client = Arc::new(ScriptedClient::new(vec![text_response("all good")]));
    let executions = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(client.clone(), registry(executions, no_delay), config(4));

    let outcome = orchestrator
        .run_turn(1, "hello", &[], &CancellationToken::new())
        .await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.rounds, 1);
    assert!(outcome.invocations.is_empty());
    assert_eq!(outcome.answer.as_deref(), Some("all good"));
    assert!(!outcome.truncated);
    assert_eq!(client.request_count().await, 1);
}

#[tokio::test]
async fn one_tool_then_answer_takes_two_rounds_and_feeds_result_back() {
    let client = Arc::new(ScriptedClient::new(vec![
        tool_call_response(&[("call_1", "shell", json!({ "command": "df -h" }))]),
        text_response("root is 40% full"),
    ]));
    let executions = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(
        client.clone(),
        registry(executions.clone(), no_delay),
        config(4),
    );

    let outcome = orchestrator
        .run_turn(3, "analyze disk usage", &[], &CancellationToken::new())
        .await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.invocations.len(), 1);
    assert_eq!(outcome.invocations[0].turn_seq, 3);
    assert_eq!(outcome.invocations[0].round, 1);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.usage.total_tokens, 37);

    let requests = client.requests.lock().await;
    let second = &requests[1].messages;
    let tool_message = second
        .iter()
        .find(|message| message.role == MessageRole::Tool)
        .expect("tool result fed back");
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
    assert!(tool_message.text_content().contains("ran df -h"));
    assert_eq!(requests[0].tools.len(), 1);
}

#[tokio::test]
async fn relentless_tool_requests_stop_after_max_plus_one_rounds() {
    let client = Arc::new(RelentlessClient {
        calls: AtomicUsize::new(0),
    });
    let executions = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(
        client.clone(),
        registry(executions.clone(), no_delay),
        config(3),
    );

    let outcome = orchestrator
        .run_turn(1, "loop forever", &[], &CancellationToken::new())
        .await;

    assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    assert_eq!(outcome.rounds, 4);
    assert_eq!(outcome.invocations.len(), 3);
    assert_eq!(executions.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert!(outcome.truncated);
    assert!(outcome
        .notice
        .as_deref()
        .expect("truncation notice")
        .contains("stopped after 3 tool rounds"));
}

#[tokio::test]
async fn zero_round_bound_allows_a_single_completion() {
    let client = Arc::new(RelentlessClient {
        calls: AtomicUsize::new(0),
    });
    let executions = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(
        client.clone(),
        registry(executions.clone(), no_delay),
        config(0),
    );

    let outcome = orchestrator
        .run_turn(1, "anything", &[], &CancellationToken::new())
        .await;

    assert_eq!(outcome.rounds, 1);
    assert!(outcome.truncated);
    assert_eq!(executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn schema_violating_call_is_reported_back_and_never_executed() {
    let client = Arc::new(ScriptedClient::new(vec![
        tool_call_response(&[("call_1", "shell", json!({ "cmd": "rm -rf /" }))]),
        text_response("sorry, I will fix the arguments"),
    ]));
    let executions = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(
        client.clone(),
        registry(executions.clone(), no_delay),
        config(4),
    );

    let outcome = orchestrator
        .run_turn(1, "clean up", &[], &CancellationToken::new())
        .await;

    assert_eq!(executions.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.invocations.len(), 1);
    let error = outcome.invocations[0].error().expect("failed invocation");
    assert_eq!(error.kind(), "schema_violation");

    let requests = client.requests.lock().await;
    let feedback = requests[1]
        .messages
        .iter()
        .find(|message| message.role == MessageRole::Tool)
        .expect("validation failure fed back");
    assert!(feedback.is_error);
    assert!(feedback.text_content().contains("schema_violation"));
}

#[tokio::test]
async fn unknown_tool_is_recorded_as_not_found_and_turn_continues() {
    let client = Arc::new(ScriptedClient::new(vec![
        tool_call_response(&[("call_1", "format_disk", json!({}))]),
        text_response("that tool does not exist"),
    ]));
    let executions = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(client, registry(executions, no_delay), config(4));

    let outcome = orchestrator
        .run_turn(1, "format", &[], &CancellationToken::new())
        .await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(
        outcome.invocations[0].error().map(|error| error.kind()),
        Some("not_found")
    );
}

fn slow_first(command: &str) -> Duration {
    if command == "first" {
        Duration::from_millis(150)
    } else {
        Duration::from_millis(10)
    }
}

#[tokio::test]
async fn parallel_calls_run_concurrently_and_are_recorded_in_request_order() {
    let client = Arc::new(ScriptedClient::new(vec![
        tool_call_response(&[
            ("call_a", "shell", json!({ "command": "first" })),
            ("call_b", "shell", json!({ "command": "second" })),
            ("call_c", "shell", json!({ "command": "third" })),
        ]),
        text_response("done"),
    ]));
    let executions = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(
        client,
        registry(executions.clone(), slow_first),
        OrchestratorConfig {
            max_parallel_tool_calls: 3,
            ..config(4)
        },
    );

    let started = Instant::now();
    let outcome = orchestrator
        .run_turn(1, "three things", &[], &CancellationToken::new())
        .await;
    let elapsed = started.elapsed();

    assert_eq!(executions.load(Ordering::SeqCst), 3);
    let order: Vec<&str> = outcome
        .invocations
        .iter()
        .map(|invocation| invocation.call_id.as_str())
        .collect();
    assert_eq!(order, vec!["call_a", "call_b", "call_c"]);
    let indices: Vec<usize> = outcome
        .invocations
        .iter()
        .map(|invocation| invocation.request_index)
        .collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(
        elapsed < Duration::from_millis(140 + 150),
        "calls should overlap, took {elapsed:?}"
    );
}

#[tokio::test]
async fn completion_failure_marks_turn_failed() {
    let client = Arc::new(ScriptedClient::new(vec![]));
    let executions = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(client, registry(executions, no_delay), config(4));

    let outcome = orchestrator
        .run_turn(1, "hello", &[], &CancellationToken::new())
        .await;

    assert_eq!(outcome.status, TurnStatus::Failed);
    assert!(outcome
        .error
        .as_deref()
        .expect("error message")
        .contains("completion service unavailable"));
}

#[tokio::test]
async fn cancellation_while_awaiting_response_marks_turn_cancelled() {
    let executions = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(
        Arc::new(StalledClient),
        registry(executions, no_delay),
        config(4),
    );
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        orchestrator.run_turn(1, "hello", &[], &token),
    )
    .await
    .expect("cancellation must end the turn promptly");

    assert_eq!(outcome.status, TurnStatus::Cancelled);
    assert!(!outcome.truncated);
}

fn slow_everything(_command: &str) -> Duration {
    Duration::from_millis(100)
}

#[tokio::test]
async fn cancellation_during_tool_execution_completes_with_truncation() {
    let client = Arc::new(ScriptedClient::new(vec![
        tool_call_response(&[("call_1", "shell", json!({ "command": "slow" }))]),
        text_response("never requested"),
    ]));
    let executions = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(
        client.clone(),
        registry(executions.clone(), slow_everything),
        config(4),
    );
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let outcome = orchestrator.run_turn(1, "slow thing", &[], &token).await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert!(outcome.truncated);
    assert_eq!(outcome.invocations.len(), 1);
    assert!(matches!(
        outcome.invocations[0].outcome,
        InvocationOutcome::Succeeded { .. }
    ));
    assert_eq!(client.request_count().await, 1);
}

#[tokio::test]
async fn history_is_replayed_between_system_prompt_and_payload() {
    let client = Arc::new(ScriptedClient::new(vec![text_response("ok")]));
    let executions = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(
        client.clone(),
        registry(executions, no_delay),
        OrchestratorConfig {
            system_prompt: "be brief".to_string(),
            ..config(2)
        },
    );
    let history = vec![
        Message::user("earlier question"),
        Message::assistant_text("earlier answer"),
    ];

    orchestrator
        .run_turn(2, "follow up", &history, &CancellationToken::new())
        .await;

    let requests = client.requests.lock().await;
    let roles: Vec<MessageRole> = requests[0]
        .messages
        .iter()
        .map(|message| message.role)
        .collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::User
        ]
    );
    assert_eq!(requests[0].messages[3].text_content(), "follow up");
}

#[tokio::test]
async fn state_events_follow_the_turn_machine() {
    let client = Arc::new(ScriptedClient::new(vec![
        tool_call_response(&[("call_1", "shell", json!({ "command": "uptime" }))]),
        text_response("fine"),
    ]));
    let executions = Arc::new(AtomicUsize::new(0));
    let mut orchestrator =
        Orchestrator::new(client, registry(executions, no_delay), config(4));
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    orchestrator.subscribe(move |event| {
        if let AgentEvent::StateChanged { to, .. } = event {
            sink.lock().expect("transition lock").push(*to);
        }
    });
    orchestrator.subscribe(|_event| panic!("misbehaving subscriber"));

    let outcome = orchestrator
        .run_turn(1, "uptime?", &[], &CancellationToken::new())
        .await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(
        *transitions.lock().expect("transition lock"),
        vec![
            LoopState::ToolRequested,
            LoopState::ExecutingTools,
            LoopState::AwaitingResponse,
            LoopState::Final
        ]
    );
}

#[test]
fn try_new_rejects_unusable_config() {
    let executions = Arc::new(AtomicUsize::new(0));
    let client: Arc<dyn LlmClient> = Arc::new(ScriptedClient::new(Vec::new()));

    let mut zero_parallel = config(2);
    zero_parallel.max_parallel_tool_calls = 0;
    let error = Orchestrator::try_new(
        Arc::clone(&client),
        registry(Arc::clone(&executions), no_delay),
        zero_parallel,
    )
    .err()
    .expect("zero parallelism rejected");
    assert!(matches!(error, OrchestratorError::InvalidConfig(_)));

    let mut hot = config(2);
    hot.temperature = Some(3.0);
    assert!(hot.validate().is_err());

    assert!(Orchestrator::try_new(client, registry(executions, no_delay), config(2)).is_ok());
}
