//! Prefix-driven classification of raw input lines.
//!
//! Pure and side-effect free: nothing here touches the network, the shell or
//! the session store.

use sita_session::{SessionExportFormat, TurnMode};

pub const SHELL_MARKER: char = '!';
pub const QUERY_MARKER: char = '?';

/// Keywords offered by tab completion and listed in `help`.
pub const CONTROL_KEYWORDS: &[&str] = &[
    "help", "config", "history", "clear", "export", "reset", "stats", "models", "exit", "quit",
];

/// Synchronous commands handled without entering the orchestration loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Empty or whitespace-only input; no turn is created.
    Noop,
    Help,
    ShowConfig,
    SetConfig { key: String, value: String },
    History,
    Clear,
    Export(SessionExportFormat),
    Reset,
    Stats,
    Models,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedInput {
    Turn { mode: TurnMode, payload: String },
    Control(ControlCommand),
}

impl ClassifiedInput {
    pub fn mode(&self) -> Option<TurnMode> {
        match self {
            ClassifiedInput::Turn { mode, .. } => Some(*mode),
            ClassifiedInput::Control(_) => None,
        }
    }
}

/// Labels `input` with exactly one execution mode.
///
/// Priority: shell marker, query marker, control keyword, then AGENT. A
/// keyword carrying arguments it does not understand is treated as a natural
/// language request rather than an error.
pub fn classify_input(input: &str) -> ClassifiedInput {
    let line = input.trim_start();
    if line.trim().is_empty() {
        return ClassifiedInput::Control(ControlCommand::Noop);
    }
    if let Some(rest) = line.strip_prefix(SHELL_MARKER) {
        return ClassifiedInput::Turn {
            mode: TurnMode::Shell,
            payload: rest.to_string(),
        };
    }
    if let Some(rest) = line.strip_prefix(QUERY_MARKER) {
        return ClassifiedInput::Turn {
            mode: TurnMode::Query,
            payload: rest.trim().to_string(),
        };
    }
    if let Some(command) = parse_control_command(line.trim()) {
        return ClassifiedInput::Control(command);
    }
    ClassifiedInput::Turn {
        mode: TurnMode::Agent,
        payload: input.trim().to_string(),
    }
}

fn parse_control_command(line: &str) -> Option<ControlCommand> {
    let mut words = line.split_whitespace();
    let keyword = words.next()?.to_ascii_lowercase();
    let rest = words.collect::<Vec<_>>();

    let bare = |command: ControlCommand| rest.is_empty().then_some(command);
    match keyword.as_str() {
        "help" => bare(ControlCommand::Help),
        "history" => bare(ControlCommand::History),
        "clear" => bare(ControlCommand::Clear),
        "reset" => bare(ControlCommand::Reset),
        "stats" => bare(ControlCommand::Stats),
        "models" => bare(ControlCommand::Models),
        "exit" | "quit" | "q" => bare(ControlCommand::Exit),
        "config" => match rest.as_slice() {
            [] => Some(ControlCommand::ShowConfig),
            [action, key, value @ ..]
                if action.eq_ignore_ascii_case("set") && !value.is_empty() =>
            {
                Some(ControlCommand::SetConfig {
                    key: key.to_ascii_lowercase(),
                    value: value.join(" "),
                })
            }
            _ => None,
        },
        "export" => match rest.as_slice() {
            [] => Some(ControlCommand::Export(SessionExportFormat::Markdown)),
            [format] => format.parse().ok().map(ControlCommand::Export),
            _ => None,
        },
        _ => None,
    }
}
