//! Read-only renderings of a session for export.
use std::fmt::Write as _;

use sita_agent_core::{InvocationOutcome, ToolInvocation};

use super::session_storage::session_to_jsonl;
use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExportFormat {
    Markdown,
    Text,
    Jsonl,
}

impl SessionExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SessionExportFormat::Markdown => "md",
            SessionExportFormat::Text => "txt",
            SessionExportFormat::Jsonl => "jsonl",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionExportFormat::Markdown => "markdown",
            SessionExportFormat::Text => "text",
            SessionExportFormat::Jsonl => "jsonl",
        }
    }
}

impl std::str::FromStr for SessionExportFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(SessionExportFormat::Markdown),
            "text" | "txt" => Ok(SessionExportFormat::Text),
            "jsonl" => Ok(SessionExportFormat::Jsonl),
            other => Err(format!(
                "unsupported export format '{other}' (expected markdown|text|jsonl)"
            )),
        }
    }
}

pub fn render_session(session: &Session, format: SessionExportFormat) -> Result<String, SessionError> {
    match format {
        SessionExportFormat::Markdown => Ok(render_markdown(session)),
        SessionExportFormat::Text => Ok(render_text(session)),
        SessionExportFormat::Jsonl => session_to_jsonl(session),
    }
}

fn invocation_payload(invocation: &ToolInvocation) -> String {
    let value = match &invocation.outcome {
        InvocationOutcome::Succeeded { result } => result.clone(),
        InvocationOutcome::Failed { error } => error.feedback(),
    };
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}

fn invocation_label(invocation: &ToolInvocation) -> String {
    match &invocation.outcome {
        InvocationOutcome::Succeeded { .. } => "ok".to_string(),
        InvocationOutcome::Failed { error } => format!("failed ({})", error.kind()),
    }
}

/// Fences `body` with one more backtick than its longest backtick run.
fn push_code_block(out: &mut String, info: &str, body: &str) {
    let longest_run = body
        .split(|ch| ch != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    let fence = "`".repeat(longest_run.max(2) + 1);
    let _ = writeln!(out, "{fence}{info}\n{body}\n{fence}\n");
}

fn render_markdown(session: &Session) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Sita session {}\n", session.id);
    let _ = writeln!(
        out,
        "- **Started:** {}",
        session.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out, "- **Provider:** {}", session.config.provider);
    let _ = writeln!(out, "- **Model:** {}", session.config.model);
    let _ = writeln!(out, "- **Turns:** {}\n", session.turns.len());

    for turn in &session.turns {
        let _ = writeln!(
            out,
            "## Turn {} · {} · {}{}\n",
            turn.seq,
            turn.mode.as_str(),
            turn.status.as_str(),
            if turn.truncated { " (truncated)" } else { "" }
        );
        let _ = writeln!(
            out,
            "*{}*\n",
            turn.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        let _ = writeln!(out, "**Input:** `{}`\n", turn.input.replace('`', "'"));
        for invocation in &turn.invocations {
            let _ = writeln!(
                out,
                "**Tool `{}`** round {} · {} · {} ms\n",
                invocation.tool_name,
                invocation.round,
                invocation_label(invocation),
                invocation.elapsed_ms()
            );
            let arguments = serde_json::to_string_pretty(&invocation.arguments)
                .unwrap_or_else(|_| invocation.arguments.to_string());
            push_code_block(&mut out, "json", &arguments);
            push_code_block(&mut out, "", &invocation_payload(invocation));
        }
        if let Some(answer) = &turn.answer {
            let _ = writeln!(out, "{answer}\n");
        }
        if let Some(notice) = &turn.notice {
            let _ = writeln!(out, "> {notice}\n");
        }
        if let Some(error) = &turn.error {
            let _ = writeln!(out, "> **Error:** {error}\n");
        }
    }
    out
}

fn render_text(session: &Session) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Sita session {}", session.id);
    let _ = writeln!(
        out,
        "Started: {}",
        session.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(
        out,
        "Provider: {}  Model: {}",
        session.config.provider, session.config.model
    );
    let _ = writeln!(out, "Turns: {}", session.turns.len());

    for turn in &session.turns {
        let _ = writeln!(out, "\n{}", "=".repeat(60));
        let _ = writeln!(
            out,
            "[{}] #{} {} {}{}",
            turn.started_at.format("%H:%M:%S"),
            turn.seq,
            turn.mode.as_str(),
            turn.status.as_str(),
            if turn.truncated { " (truncated)" } else { "" }
        );
        let _ = writeln!(out, "> {}", turn.input);
        for invocation in &turn.invocations {
            let _ = writeln!(
                out,
                "-- {} ({}, {} ms)",
                invocation.tool_name,
                invocation_label(invocation),
                invocation.elapsed_ms()
            );
            let _ = writeln!(out, "{}", invocation_payload(invocation));
        }
        if let Some(answer) = &turn.answer {
            let _ = writeln!(out, "{answer}");
        }
        if let Some(notice) = &turn.notice {
            let _ = writeln!(out, "note: {notice}");
        }
        if let Some(error) = &turn.error {
            let _ = writeln!(out, "error: {error}");
        }
    }
    out
}
