use std::sync::atomic::{AtomicU64, Ordering};

use sita_agent_core::{ToolInvocation, TurnStatus};
use sita_ai::{ChatUsage, Message};

use super::*;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
const CONTEXT_OUTPUT_CHARS: usize = 2_000;

/// How an input line was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnMode {
    Shell,
    Query,
    Agent,
}

impl TurnMode {
    pub const ALL: [TurnMode; 3] = [TurnMode::Shell, TurnMode::Query, TurnMode::Agent];

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnMode::Shell => "SHELL",
            TurnMode::Query => "QUERY",
            TurnMode::Agent => "AGENT",
        }
    }
}

/// One finalized operator interaction. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub seq: u64,
    /// Raw input line as typed.
    pub input: String,
    pub mode: TurnMode,
    /// Input with the mode prefix stripped.
    pub payload: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: TurnStatus,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion-service rounds; zero for SHELL and QUERY turns.
    #[serde(default)]
    pub rounds: usize,
    #[serde(default)]
    pub invocations: Vec<ToolInvocation>,
    #[serde(default)]
    pub usage: ChatUsage,
}

impl Turn {
    /// Text standing in for this turn's reply when it is replayed as history.
    pub fn reply_text(&self) -> String {
        if let Some(answer) = self.answer.as_deref().filter(|text| !text.trim().is_empty()) {
            return answer.to_string();
        }
        let mut reply = self
            .invocations
            .iter()
            .map(|invocation| format!("[{}] {}", invocation.tool_name, invocation.feedback_text()))
            .collect::<Vec<_>>()
            .join("\n");
        if reply.is_empty() {
            reply = self
                .error
                .clone()
                .unwrap_or_else(|| format!("turn finished {}", self.status.as_str()));
        }
        if reply.chars().count() > CONTEXT_OUTPUT_CHARS {
            let mut cut: String = reply.chars().take(CONTEXT_OUTPUT_CHARS).collect();
            cut.push_str("\n<output truncated>");
            return cut;
        }
        reply
    }
}

/// Configuration captured when a session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub show_tool_calls: bool,
    pub render_markdown: bool,
}

/// Unit of persistence: an ordered turn log plus its config snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub config: ConfigSnapshot,
    pub turns: Vec<Turn>,
}

impl Session {
    pub fn next_seq(&self) -> u64 {
        self.turns.last().map(|turn| turn.seq + 1).unwrap_or(1)
    }

    /// The last `limit` turns replayed as user/assistant message pairs.
    pub fn recent_context(&self, limit: usize) -> Vec<Message> {
        let start = self.turns.len().saturating_sub(limit);
        self.turns[start..]
            .iter()
            .flat_map(|turn| {
                [
                    Message::user(turn.input.clone()),
                    Message::assistant_text(turn.reply_text()),
                ]
            })
            .collect()
    }

    pub fn mode_count(&self, mode: TurnMode) -> usize {
        self.turns.iter().filter(|turn| turn.mode == mode).count()
    }

    pub fn invocation_count(&self) -> usize {
        self.turns.iter().map(|turn| turn.invocations.len()).sum()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            turn_count: self.turns.len(),
            provider: self.config.provider.clone(),
            model: self.config.model.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub turn_count: usize,
    pub provider: String,
    pub model: String,
}

/// Builds `<YYYYmmdd-HHMMSS>-<4 hex>` from `at` and a process-local counter.
pub fn generate_session_id(at: DateTime<Utc>) -> String {
    let counter = SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = counter
        .wrapping_mul(0x9E37_79B9)
        .wrapping_add(u64::from(std::process::id()))
        .wrapping_add(u64::from(at.timestamp_subsec_nanos()));
    format!("{}-{:04x}", at.format("%Y%m%d-%H%M%S"), mixed & 0xffff)
}

pub fn is_valid_session_id(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() == 20
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[8] == b'-'
        && bytes[9..15].iter().all(u8::is_ascii_digit)
        && bytes[15] == b'-'
        && bytes[16..]
            .iter()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(byte))
}
