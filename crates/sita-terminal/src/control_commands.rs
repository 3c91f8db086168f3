//! Synchronous control commands. None of these touch the orchestration loop.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use sita_ai::Provider;
use sita_cli::{ConfigEntry, Configuration};
use sita_core::{format_duration_hms, write_text_atomic};
use sita_session::{render_session, Session, SessionExportFormat, TurnMode};
use sita_tools::quick_query_help;

use crate::input_classifier::ControlCommand;
use crate::{ControlOutput, TerminalRuntime};

const HISTORY_LIMIT: usize = 10;
const HISTORY_INPUT_CHARS: usize = 60;
const EXPORTS_DIR: &str = "exports";
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

impl TerminalRuntime {
    pub(crate) fn execute_control(&mut self, command: ControlCommand) -> Result<ControlOutput> {
        match command {
            ControlCommand::Noop => Ok(ControlOutput::default()),
            ControlCommand::Help => Ok(ControlOutput::markdown(render_help())),
            ControlCommand::ShowConfig => Ok(ControlOutput::plain(render_config(
                &self.configuration.entries(),
            ))),
            ControlCommand::SetConfig { key, value } => self.set_config(&key, &value),
            ControlCommand::History => Ok(ControlOutput::plain(render_history(&self.session))),
            ControlCommand::Clear => Ok(ControlOutput {
                text: CLEAR_SCREEN.to_string(),
                clear_screen: true,
                ..ControlOutput::default()
            }),
            ControlCommand::Export(format) => {
                let path = export_session_to_dir(&self.session, &self.data_dir, format, Local::now())?;
                Ok(ControlOutput::plain(format!(
                    "Exported {} turn(s) to {}",
                    self.session.turns.len(),
                    path.display()
                )))
            }
            ControlCommand::Reset => {
                let previous = self.session.id.clone();
                self.session = self
                    .store
                    .create(self.configuration.snapshot())
                    .context("failed to start a new session")?;
                tracing::info!(previous = %previous, session_id = %self.session.id, "session reset");
                Ok(ControlOutput::plain(format!(
                    "Started session {} (previous session {previous} is kept).",
                    self.session.id
                )))
            }
            ControlCommand::Stats => Ok(ControlOutput::plain(render_stats(
                &self.session,
                &self.configuration,
                Utc::now(),
            ))),
            ControlCommand::Models => Ok(ControlOutput::plain(render_models(
                self.configuration.provider,
                &self.configuration.model,
            ))),
            ControlCommand::Exit => Ok(ControlOutput {
                text: "Goodbye.".to_string(),
                exit: true,
                ..ControlOutput::default()
            }),
        }
    }

    fn set_config(&mut self, key: &str, value: &str) -> Result<ControlOutput> {
        let changed = match self.configuration.set(key, value) {
            Ok(changed) => changed,
            Err(error) => return Ok(ControlOutput::plain(format!("error: {error}"))),
        };
        if changed.is_empty() {
            return Ok(ControlOutput::plain(format!("{key} unchanged")));
        }
        self.configuration
            .persist_keys(&self.settings, &changed)
            .context("failed to persist configuration")?;
        self.invalidate_client();
        tracing::info!(keys = %changed.join(","), "configuration updated");
        let lines = self
            .configuration
            .entries()
            .into_iter()
            .filter(|entry| changed.contains(&entry.key))
            .map(|entry| format!("set {} = {}", entry.key, entry.value))
            .collect::<Vec<_>>();
        Ok(ControlOutput::plain(lines.join("\n")))
    }
}

pub fn render_help() -> String {
    let mut out = String::new();
    out.push_str("## sita\n\n");
    out.push_str("**Input modes**\n\n");
    out.push_str("- `!<command>` runs a shell command directly, e.g. `!df -h`\n");
    out.push_str("- `?<query>` runs a quick system check, e.g. `?disk usage`\n");
    out.push_str("- anything else is sent to the assistant, which may run tools\n\n");
    out.push_str("**Commands**\n\n");
    out.push_str("- `help` show this help\n");
    out.push_str("- `config` show settings; `config set <key> <value>` change one\n");
    out.push_str("- `history` last turns of this session\n");
    out.push_str("- `clear` clear the screen\n");
    out.push_str("- `export [markdown|text|jsonl]` write the session to the exports directory\n");
    out.push_str("- `reset` start a new session\n");
    out.push_str("- `stats` session statistics\n");
    out.push_str("- `models` models of the current provider\n");
    out.push_str("- `exit`, `quit` or `q` leave\n\n");
    out.push_str("**Quick queries**\n\n```\n");
    out.push_str(&quick_query_help());
    out.push_str("\n```\n\nPress Ctrl-C while a request runs to cancel it.\n");
    out
}

pub fn render_config(entries: &[ConfigEntry]) -> String {
    let width = entries.iter().map(|entry| entry.key.len()).max().unwrap_or(0);
    entries
        .iter()
        .map(|entry| format!("{:<width$}  {}", entry.key, entry.value))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_history(session: &Session) -> String {
    if session.turns.is_empty() {
        return "No turns in this session yet.".to_string();
    }
    let skipped = session.turns.len().saturating_sub(HISTORY_LIMIT);
    let mut out = String::new();
    for turn in &session.turns[skipped..] {
        let _ = writeln!(
            out,
            "{:>3} [{}] {:<5} {:<9} {}",
            turn.seq,
            turn.started_at.with_timezone(&Local).format("%H:%M:%S"),
            turn.mode.as_str(),
            turn.status.as_str(),
            truncate_chars(&turn.input, HISTORY_INPUT_CHARS)
        );
    }
    if skipped > 0 {
        let _ = writeln!(out, "... and {skipped} more");
    }
    out.trim_end().to_string()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut cut = text.chars().take(limit).collect::<String>();
    cut.push_str("...");
    cut
}

pub fn render_stats(session: &Session, configuration: &Configuration, now: DateTime<Utc>) -> String {
    let elapsed = now
        .signed_duration_since(session.created_at)
        .num_seconds()
        .max(0) as u64;
    let mut out = String::new();
    let _ = writeln!(out, "Session:      {}", session.id);
    let _ = writeln!(
        out,
        "Started:      {}",
        session.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(out, "Duration:     {}", format_duration_hms(elapsed));
    let _ = writeln!(out, "Turns:        {}", session.turns.len());
    for mode in TurnMode::ALL {
        let _ = writeln!(out, "  {:<10} {}", mode.as_str(), session.mode_count(mode));
    }
    let _ = writeln!(out, "Tool calls:   {}", session.invocation_count());
    let tokens = session
        .turns
        .iter()
        .map(|turn| turn.usage.total_tokens)
        .sum::<u64>();
    let _ = writeln!(out, "Tokens:       {tokens}");
    let _ = writeln!(out, "Provider:     {}", configuration.provider.display_name());
    let _ = write!(out, "Model:        {}", configuration.model);
    out
}

pub fn render_models(provider: Provider, current_model: &str) -> String {
    let mut out = format!("{} models:\n", provider.display_name());
    for model in provider.model_catalog() {
        let marker = if model.id == current_model { "*" } else { " " };
        let _ = writeln!(out, "{marker} {:<48} {}", model.id, model.description);
    }
    if !provider
        .model_catalog()
        .iter()
        .any(|model| model.id == current_model)
    {
        let _ = writeln!(out, "* {current_model} (custom)");
    }
    out.push_str("Change with: config set agent.model <id>");
    out
}

/// Writes a read-only rendering of `session` under `<data_dir>/exports`.
pub fn export_session_to_dir(
    session: &Session,
    data_dir: &Path,
    format: SessionExportFormat,
    now: DateTime<Local>,
) -> Result<PathBuf> {
    let content = render_session(session, format)
        .with_context(|| format!("failed to render session {}", session.id))?;
    let exports = data_dir.join(EXPORTS_DIR);
    let stem = format!("session_{}", now.format("%Y%m%d_%H%M%S"));
    let mut path = exports.join(format!("{stem}.{}", format.extension()));
    let mut attempt = 1;
    while path.exists() {
        path = exports.join(format!("{stem}_{attempt}.{}", format.extension()));
        attempt += 1;
    }
    write_text_atomic(&path, &content)?;
    tracing::info!(session_id = %session.id, path = %path.display(), format = format.as_str(), "exported session");
    Ok(path)
}
