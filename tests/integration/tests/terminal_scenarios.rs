use std::{
    collections::VecDeque,
    fs,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use sita_agent_core::{
    AgentTool, CancellationToken, Orchestrator, OrchestratorConfig, ToolContract,
    ToolExecutionResult, ToolInvokeError, ToolRegistry, TurnStatus,
};
use sita_ai::{
    ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient, Message, SitaAiError,
};
use sita_cli::Configuration;
use sita_session::{
    SessionError, SessionExportFormat, SessionStorageBackend, SessionStore, TurnMode,
};
use sita_terminal::{
    build_tool_registry, ClientFactory, InputOutcome, RuntimeParts, TerminalRuntime, TurnLimits,
};
use tempfile::tempdir;
use tokio::sync::Mutex as AsyncMutex;

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
        let mut responses = self.responses.lock().await;
        responses
            .pop_front()
            .ok_or_else(|| SitaAiError::InvalidResponse("scripted response queue exhausted".into()))
    }
}

/// Requests one more `marker` call on every round, forever.
struct EndlessToolClient {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for EndlessToolClient {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, SitaAiError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("call_{call}");
        Ok(tool_calls(&[(
            id.as_str(),
            "marker",
            json!({ "label": format!("round-{call}") }),
        )]))
    }
}

/// Side-effecting stub that records each execution.
struct MarkerTool {
    executions: Arc<AsyncMutex<Vec<String>>>,
    delay_for: fn(&str) -> Duration,
    max_duration: Duration,
}

impl MarkerTool {
    fn new(executions: Arc<AsyncMutex<Vec<String>>>) -> Self {
        Self {
            executions,
            delay_for: |_| Duration::ZERO,
            max_duration: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl AgentTool for MarkerTool {
    fn contract(&self) -> ToolContract {
        ToolContract {
            name: "marker".to_string(),
            description: "Records a labelled marker".to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "label": { "type": "string", "minLength": 1 } },
                "required": ["label"],
                "additionalProperties": false
            }),
            result_schema: json!({
                "type": "object",
                "required": ["label"]
            }),
            max_duration: self.max_duration,
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let label = arguments
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        tokio::time::sleep((self.delay_for)(&label)).await;
        self.executions.lock().await.push(label.clone());
        ToolExecutionResult::ok(json!({ "label": label }))
    }
}

struct DiskUsageStub {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentTool for DiskUsageStub {
    fn contract(&self) -> ToolContract {
        ToolContract {
            name: "disk_usage".to_string(),
            description: "Filesystem usage".to_string(),
            parameters: json!({ "type": "object", "additionalProperties": false }),
            result_schema: json!({ "type": "object", "required": ["report"] }),
            max_duration: Duration::from_secs(10),
        }
    }

    async fn execute(&self, _arguments: Value) -> ToolExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ToolExecutionResult::ok(json!({
            "report": "Filesystem  Size  Used Avail Use% Mounted on\n/dev/sda1   100G   41G   59G  41% /\n"
        }))
    }
}

fn tool_calls(calls: &[(&str, &str, Value)]) -> ChatResponse {
    ChatResponse {
        message: Message::assistant_blocks(
            calls
                .iter()
                .map(|(id, name, arguments)| ContentBlock::ToolCall {
                    id: (*id).to_string(),
                    name: (*name).to_string(),
                    arguments: arguments.clone(),
                })
                .collect(),
        ),
        finish_reason: Some("tool_calls".to_string()),
        usage: ChatUsage::default(),
    }
}

fn answer(text: &str) -> ChatResponse {
    ChatResponse {
        message: Message::assistant_text(text),
        finish_reason: Some("stop".to_string()),
        usage: ChatUsage::default(),
    }
}

fn marker_registry(tool: MarkerTool) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(tool))
        .expect("marker registers");
    Arc::new(registry)
}

fn orchestrator_config(max_rounds: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        max_rounds,
        ..OrchestratorConfig::default()
    }
}

/// Terminal runtime over the real built-in tools plus a stub completion client.
fn terminal_runtime(
    data_dir: &Path,
    backend: SessionStorageBackend,
    client: Arc<dyn LlmClient>,
    resume: Option<&str>,
) -> TerminalRuntime {
    let (configuration, settings) =
        Configuration::load_from_data_dir(data_dir).expect("configuration");
    let store = SessionStore::open(data_dir, backend).expect("store");
    let session = match resume {
        Some(id) => store.load(id).expect("resume"),
        None => store.create(configuration.snapshot()).expect("session"),
    };
    let client_factory: ClientFactory =
        Arc::new(move |_: &Configuration| Ok::<_, anyhow::Error>(Arc::clone(&client)));
    TerminalRuntime::new(RuntimeParts {
        configuration,
        settings,
        store,
        session,
        registry: build_tool_registry(5_000).expect("built-in tools"),
        client_factory,
        limits: TurnLimits::default(),
        data_dir: data_dir.to_path_buf(),
    })
}

async fn submit(runtime: &mut TerminalRuntime, input: &str) -> sita_session::Turn {
    match runtime
        .handle_input(input, &CancellationToken::new())
        .await
        .expect("input handled")
    {
        InputOutcome::Turn(turn) => *turn,
        other => panic!("expected a turn for {input:?}, got {other:?}"),
    }
}

#[tokio::test]
async fn integration_relentless_tool_requests_stop_after_max_plus_one_rounds() {
    let executions = Arc::new(AsyncMutex::new(Vec::new()));
    let client = Arc::new(EndlessToolClient {
        calls: AtomicUsize::new(0),
    });
    let orchestrator = Orchestrator::new(
        client.clone(),
        marker_registry(MarkerTool::new(Arc::clone(&executions))),
        orchestrator_config(3),
    );

    let outcome = orchestrator
        .run_turn(1, "keep probing", &[], &CancellationToken::new())
        .await;

    assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    assert_eq!(outcome.rounds, 4);
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert!(outcome.truncated);
    assert!(outcome
        .notice
        .as_deref()
        .is_some_and(|notice| notice.starts_with("stopped after 3 tool rounds")));
    assert_eq!(
        *executions.lock().await,
        vec!["round-1", "round-2", "round-3"]
    );
    assert_eq!(outcome.invocations.len(), 3);
}

#[tokio::test]
async fn integration_schema_violation_is_never_executed_and_loop_recovers() {
    let executions = Arc::new(AsyncMutex::new(Vec::new()));
    let client = Arc::new(ScriptedClient::new(vec![
        tool_calls(&[("call_bad", "marker", json!({ "label": 7, "extra": true }))]),
        tool_calls(&[("call_good", "marker", json!({ "label": "fixed" }))]),
        answer("marker recorded"),
    ]));
    let orchestrator = Orchestrator::new(
        client.clone(),
        marker_registry(MarkerTool::new(Arc::clone(&executions))),
        orchestrator_config(4),
    );

    let outcome = orchestrator
        .run_turn(1, "record a marker", &[], &CancellationToken::new())
        .await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.rounds, 3);
    assert_eq!(*executions.lock().await, vec!["fixed"]);
    assert!(matches!(
        outcome.invocations[0].error(),
        Some(ToolInvokeError::SchemaViolation { .. })
    ));
    assert!(outcome.invocations[1].is_success());

    let requests = client.requests.lock().await;
    let feedback = requests[1]
        .messages
        .last()
        .expect("tool feedback message")
        .text_content();
    assert!(feedback.contains("schema_violation"));
}

#[tokio::test]
async fn integration_parallel_calls_are_recorded_in_request_order() {
    let executions = Arc::new(AsyncMutex::new(Vec::new()));
    let tool = MarkerTool {
        executions: Arc::clone(&executions),
        delay_for: |label| match label {
            "slow" => Duration::from_millis(120),
            "medium" => Duration::from_millis(60),
            _ => Duration::ZERO,
        },
        max_duration: Duration::from_secs(5),
    };
    let client = Arc::new(ScriptedClient::new(vec![
        tool_calls(&[
            ("call_a", "marker", json!({ "label": "slow" })),
            ("call_b", "marker", json!({ "label": "medium" })),
            ("call_c", "marker", json!({ "label": "fast" })),
        ]),
        answer("all markers done"),
    ]));
    let orchestrator = Orchestrator::new(client, marker_registry(tool), orchestrator_config(2));

    let outcome = orchestrator
        .run_turn(7, "marker everything", &[], &CancellationToken::new())
        .await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(*executions.lock().await, vec!["fast", "medium", "slow"]);
    assert_eq!(
        outcome
            .invocations
            .iter()
            .map(|invocation| (invocation.request_index, invocation.call_id.as_str()))
            .collect::<Vec<_>>(),
        vec![(0, "call_a"), (1, "call_b"), (2, "call_c")]
    );
    assert!(outcome.invocations.iter().all(|invocation| invocation.turn_seq == 7));
}

#[tokio::test]
async fn integration_cancellation_while_executing_tools_truncates_turn() {
    let executions = Arc::new(AsyncMutex::new(Vec::new()));
    let tool = MarkerTool {
        executions: Arc::clone(&executions),
        delay_for: |_| Duration::from_millis(400),
        max_duration: Duration::from_secs(5),
    };
    let client = Arc::new(ScriptedClient::new(vec![
        tool_calls(&[("call_1", "marker", json!({ "label": "long" }))]),
        answer("unreachable"),
    ]));
    let orchestrator =
        Orchestrator::new(client.clone(), marker_registry(tool), orchestrator_config(4));
    let cancellation = CancellationToken::new();
    let trigger = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        trigger.cancel();
    });

    let outcome = orchestrator
        .run_turn(1, "long marker", &[], &cancellation)
        .await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert!(outcome.truncated);
    assert_eq!(client.request_count().await, 1);
}

#[tokio::test]
async fn integration_timed_out_tool_is_recorded_and_fed_back() {
    let executions = Arc::new(AsyncMutex::new(Vec::new()));
    let tool = MarkerTool {
        executions: Arc::clone(&executions),
        delay_for: |_| Duration::from_secs(5),
        max_duration: Duration::from_millis(50),
    };
    let client = Arc::new(ScriptedClient::new(vec![
        tool_calls(&[("call_1", "marker", json!({ "label": "hang" }))]),
        answer("the marker timed out"),
    ]));
    let orchestrator =
        Orchestrator::new(client.clone(), marker_registry(tool), orchestrator_config(4));

    let outcome = orchestrator
        .run_turn(1, "marker", &[], &CancellationToken::new())
        .await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.rounds, 2);
    assert!(matches!(
        outcome.invocations[0].error(),
        Some(ToolInvokeError::Timeout { timeout_ms: 50, .. })
    ));
    assert!(executions.lock().await.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn integration_shell_turn_uses_real_shell_without_completion_call() {
    let temp = tempdir().expect("tempdir");
    let client = Arc::new(ScriptedClient::new(Vec::new()));
    let mut runtime = terminal_runtime(
        temp.path(),
        SessionStorageBackend::Jsonl,
        client.clone(),
        None,
    );

    let turn = submit(&mut runtime, "!printf '%s|%s' 'a  b' c").await;

    assert_eq!(turn.mode, TurnMode::Shell);
    assert_eq!(turn.payload, "printf '%s|%s' 'a  b' c");
    assert_eq!(turn.status, TurnStatus::Completed);
    assert_eq!(turn.invocations.len(), 1);
    let result = turn.invocations[0].result().expect("shell result");
    assert_eq!(result["stdout"], json!("a  b|c"));
    assert_eq!(result["exit_code"], json!(0));
    assert_eq!(client.request_count().await, 0);
}

#[tokio::test]
async fn integration_quick_query_invokes_exactly_one_registered_tool() {
    let temp = tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(DiskUsageStub {
            calls: Arc::clone(&calls),
        }))
        .expect("register");
    let (configuration, settings) =
        Configuration::load_from_data_dir(temp.path()).expect("configuration");
    let store = SessionStore::open(temp.path(), SessionStorageBackend::Sqlite).expect("store");
    let session = store.create(configuration.snapshot()).expect("session");
    let client = Arc::new(ScriptedClient::new(Vec::new()));
    let factory_client: Arc<dyn LlmClient> = client.clone();
    let mut runtime = TerminalRuntime::new(RuntimeParts {
        configuration,
        settings,
        store,
        session,
        registry: Arc::new(registry),
        client_factory: Arc::new(move |_: &Configuration| {
            Ok::<_, anyhow::Error>(Arc::clone(&factory_client))
        }),
        limits: TurnLimits::default(),
        data_dir: temp.path().to_path_buf(),
    });

    let turn = submit(&mut runtime, "?disk usage").await;

    assert_eq!(turn.mode, TurnMode::Query);
    assert_eq!(turn.status, TurnStatus::Completed);
    assert_eq!(turn.invocations.len(), 1);
    assert_eq!(turn.invocations[0].tool_name, "disk_usage");
    assert_eq!(turn.invocations[0].arguments, json!({}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.request_count().await, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn integration_agent_turn_with_one_shell_round() {
    let temp = tempdir().expect("tempdir");
    let client = Arc::new(ScriptedClient::new(vec![
        tool_calls(&[("call_1", "shell", json!({ "command": "echo 41%" }))]),
        answer("The root filesystem is 41% used."),
    ]));
    let mut runtime = terminal_runtime(
        temp.path(),
        SessionStorageBackend::Jsonl,
        client.clone(),
        None,
    );

    let turn = submit(&mut runtime, "analyze disk usage").await;

    assert_eq!(turn.mode, TurnMode::Agent);
    assert_eq!(turn.status, TurnStatus::Completed);
    assert_eq!(turn.rounds, 2);
    assert_eq!(turn.invocations.len(), 1);
    assert!(turn.invocations[0].is_success());
    assert_eq!(client.request_count().await, 2);
    assert_eq!(
        turn.answer.as_deref(),
        Some("The root filesystem is 41% used.")
    );
}

#[cfg(unix)]
#[tokio::test]
async fn integration_sequence_numbers_stay_gap_free_across_resume() {
    let temp = tempdir().expect("tempdir");
    let client: Arc<dyn LlmClient> = Arc::new(ScriptedClient::new(vec![answer("noted")]));
    let session_id = {
        let mut runtime = terminal_runtime(
            temp.path(),
            SessionStorageBackend::Sqlite,
            Arc::clone(&client),
            None,
        );
        submit(&mut runtime, "!true").await;
        submit(&mut runtime, "?no such query").await;
        runtime.session().id.clone()
    };

    let mut resumed = terminal_runtime(
        temp.path(),
        SessionStorageBackend::Sqlite,
        client,
        Some(&session_id),
    );
    let turn = submit(&mut resumed, "remember this").await;
    assert_eq!(turn.seq, 3);

    let store = SessionStore::open(temp.path(), SessionStorageBackend::Sqlite).expect("store");
    let loaded = store.load(&session_id).expect("load");
    assert_eq!(
        loaded.turns.iter().map(|turn| turn.seq).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn integration_export_then_import_round_trips_turns() {
    let source_dir = tempdir().expect("source");
    let client: Arc<dyn LlmClient> = Arc::new(ScriptedClient::new(vec![answer("ok")]));
    let mut runtime = terminal_runtime(
        source_dir.path(),
        SessionStorageBackend::Jsonl,
        client,
        None,
    );
    submit(&mut runtime, "!echo one").await;
    submit(&mut runtime, "!exit 2").await;
    submit(&mut runtime, "?weather").await;
    submit(&mut runtime, "summarize").await;
    let original = runtime.session().clone();

    let exported = runtime
        .store()
        .export(&original.id, SessionExportFormat::Jsonl)
        .expect("export");

    let target_dir = tempdir().expect("target");
    let target = SessionStore::open(target_dir.path(), SessionStorageBackend::Sqlite).expect("store");
    let imported = target.import_jsonl(&exported).expect("import");
    let reloaded = target.load(&original.id).expect("reload");

    for session in [&imported, &reloaded] {
        assert_eq!(session.turns.len(), original.turns.len());
        assert_eq!(
            session.turns.iter().map(|turn| (turn.seq, turn.status)).collect::<Vec<_>>(),
            vec![
                (1, TurnStatus::Completed),
                (2, TurnStatus::Failed),
                (3, TurnStatus::Failed),
                (4, TurnStatus::Completed),
            ]
        );
    }
    assert_eq!(reloaded.config, original.config);
    assert!(matches!(
        target.import_jsonl(&exported),
        Err(SessionError::AlreadyExists(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn regression_corrupted_session_is_reported_and_new_sessions_still_work() {
    let temp = tempdir().expect("tempdir");
    let client: Arc<dyn LlmClient> = Arc::new(ScriptedClient::new(Vec::new()));
    let session_id = {
        let mut runtime = terminal_runtime(
            temp.path(),
            SessionStorageBackend::Jsonl,
            Arc::clone(&client),
            None,
        );
        submit(&mut runtime, "!true").await;
        runtime.session().id.clone()
    };

    let path = temp
        .path()
        .join("sessions")
        .join(format!("{session_id}.jsonl"));
    let mut raw = fs::read_to_string(&path).expect("session file");
    raw.push_str("{\"record_type\":\"turn\",\"seq\":\n");
    fs::write(&path, raw).expect("corrupt session");

    let store = SessionStore::open(temp.path(), SessionStorageBackend::Jsonl).expect("store");
    let error = store.load(&session_id).expect_err("corruption detected");
    assert!(matches!(error, SessionError::StoreCorrupted { .. }));
    assert!(error.is_corruption());

    let mut fresh = terminal_runtime(temp.path(), SessionStorageBackend::Jsonl, client, None);
    let turn = submit(&mut fresh, "!true").await;
    assert_eq!(turn.seq, 1);
    assert_ne!(fresh.session().id, session_id);
}
