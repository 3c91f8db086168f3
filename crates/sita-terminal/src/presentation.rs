//! Terminal rendering of control output, finished turns and tool events.

use std::io::Write;
use std::sync::Arc;

use sita_agent_core::{AgentEvent, ToolInvocation};
use sita_session::{Turn, TurnMode};
use termimad::MadSkin;

use crate::turn_dispatch::invocation_output;
use crate::{ControlOutput, EventSink};

const EVENT_ARGUMENT_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Markdown(String),
    Plain(String),
    Status(String),
}

pub struct Presenter {
    render_markdown: bool,
    skin: MadSkin,
}

impl Presenter {
    pub fn new(render_markdown: bool) -> Self {
        Self {
            render_markdown,
            skin: MadSkin::default(),
        }
    }

    pub fn set_render_markdown(&mut self, render_markdown: bool) {
        self.render_markdown = render_markdown;
    }

    pub fn print_control(&self, output: &ControlOutput) {
        if output.clear_screen {
            print!("{}", output.text);
            let _ = std::io::stdout().flush();
            return;
        }
        if output.text.is_empty() {
            return;
        }
        if output.markdown {
            self.print_segment(&Segment::Markdown(output.text.clone()));
        } else {
            self.print_segment(&Segment::Plain(output.text.clone()));
        }
    }

    pub fn print_turn(&self, turn: &Turn) {
        for segment in turn_segments(turn) {
            self.print_segment(&segment);
        }
    }

    fn print_segment(&self, segment: &Segment) {
        match segment {
            Segment::Markdown(text) if self.render_markdown => self.skin.print_text(text),
            Segment::Markdown(text) | Segment::Plain(text) => println!("{}", text.trim_end()),
            Segment::Status(text) => println!("[{text}]"),
        }
    }
}

/// Subscriber that echoes tool activity while an AGENT turn runs.
pub fn tool_event_sink() -> EventSink {
    Arc::new(|event: &AgentEvent| {
        if let Some(line) = format_event(event) {
            println!("{line}");
        }
    })
}

pub fn format_event(event: &AgentEvent) -> Option<String> {
    match event {
        AgentEvent::ToolExecutionStart {
            round,
            tool_name,
            arguments,
            ..
        } => {
            let mut preview = arguments.to_string();
            if preview.chars().count() > EVENT_ARGUMENT_PREVIEW_CHARS {
                preview = preview
                    .chars()
                    .take(EVENT_ARGUMENT_PREVIEW_CHARS)
                    .collect::<String>();
                preview.push_str("...");
            }
            Some(format!("-> [round {round}] {tool_name} {preview}"))
        }
        AgentEvent::ToolExecutionEnd { invocation } => Some(format!(
            "<- {} {} ({} ms)",
            invocation.tool_name,
            invocation_status(invocation),
            invocation.elapsed_ms()
        )),
        AgentEvent::StateChanged { .. }
        | AgentEvent::RoundCompleted { .. }
        | AgentEvent::TurnFinished { .. } => None,
    }
}

fn invocation_status(invocation: &ToolInvocation) -> String {
    match invocation.error() {
        None => "ok".to_string(),
        Some(error) => format!("failed: {error}"),
    }
}

/// What a finished turn shows on screen, in order.
pub fn turn_segments(turn: &Turn) -> Vec<Segment> {
    let mut segments = Vec::new();
    match turn.mode {
        TurnMode::Shell | TurnMode::Query => {
            for invocation in &turn.invocations {
                if let Some(output) = invocation_output(invocation).filter(|o| !o.trim().is_empty())
                {
                    segments.push(Segment::Plain(output));
                }
            }
        }
        TurnMode::Agent => {
            if let Some(answer) = turn.answer.as_deref().filter(|a| !a.trim().is_empty()) {
                segments.push(Segment::Markdown(answer.to_string()));
            }
        }
    }
    if let Some(notice) = &turn.notice {
        segments.push(Segment::Plain(format!("note: {notice}")));
    }
    if let Some(error) = &turn.error {
        segments.push(Segment::Plain(format!("error: {error}")));
    }
    segments.push(Segment::Status(status_line(turn)));
    segments
}

pub fn status_line(turn: &Turn) -> String {
    let mut parts = vec![format!("#{} {}", turn.seq, turn.status.as_str())];
    if turn.truncated {
        parts.push("truncated".to_string());
    }
    if turn.mode == TurnMode::Agent {
        parts.push(format!(
            "{} round{}",
            turn.rounds,
            if turn.rounds == 1 { "" } else { "s" }
        ));
    }
    parts.push(format!(
        "{} tool call{}",
        turn.invocations.len(),
        if turn.invocations.len() == 1 { "" } else { "s" }
    ));
    if turn.usage.total_tokens > 0 {
        parts.push(format!("{} tokens", turn.usage.total_tokens));
    }
    let elapsed_ms = turn
        .finished_at
        .signed_duration_since(turn.started_at)
        .num_milliseconds()
        .max(0);
    parts.push(format!("{elapsed_ms} ms"));
    parts.join(" · ")
}
