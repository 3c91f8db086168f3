//! Process startup: configuration, stores, tools and mode selection.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sita_agent_core::ToolRegistry;
use sita_cli::{Cli, Configuration};
use sita_session::{SessionStorageBackend, SessionStore};
use sita_tools::{register_builtin_tools, ToolPolicy};

use crate::presentation::{tool_event_sink, Presenter};
use crate::provider_client::{build_provider_client, ClientSettings};
use crate::runtime_loop::{run_interactive, run_one_shot};
use crate::{ClientFactory, RuntimeParts, TerminalRuntime, TurnLimits};

/// Runs the binary for parsed arguments and returns the process exit code.
pub async fn run_cli(cli: Cli) -> Result<i32> {
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("failed to create data directory {}", cli.data_dir.display()))?;

    let (mut configuration, settings) = Configuration::load_from_data_dir(&cli.data_dir)
        .context("failed to load configuration")?;
    configuration.apply_cli_overrides(&cli);

    let backend = SessionStorageBackend::from(cli.session_backend);
    let store = SessionStore::open(&cli.data_dir, backend).context("failed to open session store")?;

    if cli.list_sessions {
        print_session_list(&store)?;
        return Ok(0);
    }
    if let Some(session_id) = cli.export_session.as_deref() {
        let rendered = store
            .export(session_id, cli.export_format.into())
            .with_context(|| format!("failed to export session {session_id}"))?;
        print!("{rendered}");
        return Ok(0);
    }
    if let Some(path) = cli.import_session.as_deref() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let session = store
            .import_jsonl(&raw)
            .with_context(|| format!("failed to import {}", path.display()))?;
        println!(
            "imported session {} ({} turns)",
            session.id,
            session.turns.len()
        );
        return Ok(0);
    }

    let registry = build_tool_registry(cli.tool_timeout_ms)?;
    let session = match cli.resume.as_deref() {
        Some(session_id) => store
            .load(session_id)
            .with_context(|| format!("failed to resume session {session_id}"))?,
        None => store
            .create(configuration.snapshot())
            .context("failed to start session")?,
    };

    let client_settings = ClientSettings {
        api_base: cli.api_base.clone(),
        request_timeout_ms: cli.request_timeout_ms,
        max_retries: cli.request_max_retries,
    };
    let client_factory: ClientFactory = Arc::new(move |configuration: &Configuration| {
        build_provider_client(configuration, &client_settings)
    });

    let mut runtime = TerminalRuntime::new(RuntimeParts {
        configuration,
        settings,
        store,
        session,
        registry,
        client_factory,
        limits: TurnLimits {
            max_rounds: cli.max_rounds,
            max_parallel_tool_calls: cli.max_parallel_tool_calls,
            history_turns: cli.history_turns,
        },
        data_dir: cli.data_dir.clone(),
    });
    runtime.set_event_sink(Some(tool_event_sink()));
    let mut presenter = Presenter::new(runtime.configuration().render_markdown);

    if let Some(command) = cli.command.as_deref() {
        return run_one_shot(&mut runtime, &mut presenter, command).await;
    }

    print_banner(&runtime);
    run_interactive(&mut runtime, &mut presenter).await?;
    Ok(0)
}

pub fn build_tool_registry(tool_timeout_ms: u64) -> Result<Arc<ToolRegistry>> {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(
        &mut registry,
        ToolPolicy::default().with_tool_timeout_ms(tool_timeout_ms),
    )
    .context("failed to register built-in tools")?;
    if registry.is_empty() {
        bail!("no tools registered");
    }
    Ok(Arc::new(registry))
}

fn print_session_list(store: &SessionStore) -> Result<()> {
    let summaries = store.list().context("failed to list sessions")?;
    if summaries.is_empty() {
        println!("no sessions in {}", store.data_dir().display());
        return Ok(());
    }
    for summary in summaries {
        println!(
            "{}  {}  {:>4} turns  {}/{}",
            summary.id,
            summary.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            summary.turn_count,
            summary.provider,
            summary.model
        );
    }
    Ok(())
}

fn print_banner(runtime: &TerminalRuntime) {
    let configuration = runtime.configuration();
    println!("sita {}: system intelligence terminal assistant", env!("CARGO_PKG_VERSION"));
    println!("system:   {}", runtime.platform().describe());
    println!(
        "provider: {} ({})",
        configuration.provider.display_name(),
        configuration.model
    );
    println!(
        "session:  {} ({} turns, {})",
        runtime.session().id,
        runtime.session().turns.len(),
        runtime.store().backend().as_str()
    );
    println!("type 'help' for commands, '!cmd' for shell, '?query' for quick checks, 'exit' to quit");
}
