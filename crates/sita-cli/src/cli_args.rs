use std::path::PathBuf;

use clap::Parser;
use sita_ai::Provider;

use crate::{CliExportFormat, CliSessionBackend};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_temperature(value: &str) -> Result<f32, String> {
    let parsed = value
        .parse::<f32>()
        .map_err(|error| format!("failed to parse float: {error}"))?;
    if !parsed.is_finite() || !(0.0..=2.0).contains(&parsed) {
        return Err("temperature must be within 0.0..=2.0".to_string());
    }
    Ok(parsed)
}

fn parse_provider(value: &str) -> Result<Provider, String> {
    value.parse::<Provider>().map_err(|error| error.to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "sita",
    about = "Terminal system administration assistant with shell passthrough, quick system queries and a tool-calling agent",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "SITA_PROVIDER",
        value_parser = parse_provider,
        help = "Completion provider for this run: openai, google, openrouter, together (not persisted)"
    )]
    pub provider: Option<Provider>,

    #[arg(
        long,
        env = "SITA_MODEL",
        help = "Model identifier for this run (not persisted)"
    )]
    pub model: Option<String>,

    #[arg(
        long,
        value_parser = parse_temperature,
        help = "Sampling temperature override in 0.0..=2.0"
    )]
    pub temperature: Option<f32>,

    #[arg(
        long = "max-tokens",
        value_parser = parse_positive_u32,
        help = "Maximum output tokens per completion"
    )]
    pub max_tokens: Option<u32>,

    #[arg(
        long = "api-base",
        env = "SITA_API_BASE",
        help = "Override the provider endpoint base URL"
    )]
    pub api_base: Option<String>,

    #[arg(
        long = "data-dir",
        env = "SITA_DATA_DIR",
        default_value = ".sita",
        help = "Directory holding settings, sessions, exports, logs and REPL history"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "session-backend",
        env = "SITA_SESSION_BACKEND",
        value_enum,
        default_value = "jsonl",
        help = "Session persistence backend"
    )]
    pub session_backend: CliSessionBackend,

    #[arg(long, help = "Resume a persisted session by id instead of starting a new one")]
    pub resume: Option<String>,

    #[arg(
        long = "list-sessions",
        conflicts_with = "command",
        help = "Print persisted sessions (newest first) and exit"
    )]
    pub list_sessions: bool,

    #[arg(
        long = "export-session",
        value_name = "SESSION_ID",
        help = "Render a persisted session to stdout and exit"
    )]
    pub export_session: Option<String>,

    #[arg(
        long = "export-format",
        value_enum,
        default_value = "markdown",
        requires = "export_session",
        help = "Format used with --export-session"
    )]
    pub export_format: CliExportFormat,

    #[arg(
        long = "import-session",
        value_name = "PATH",
        help = "Import a JSONL session export into the store and exit"
    )]
    pub import_session: Option<PathBuf>,

    #[arg(
        long,
        short = 'c',
        help = "Run one input line (same syntax as the REPL) and exit; exit code 0 when the turn completes"
    )]
    pub command: Option<String>,

    #[arg(
        long = "max-rounds",
        default_value_t = 8,
        help = "Tool round trips allowed per agent turn before forced finalization"
    )]
    pub max_rounds: usize,

    #[arg(
        long = "max-parallel-tool-calls",
        default_value_t = 4,
        value_parser = parse_positive_usize,
        help = "Tool calls from one round executed concurrently"
    )]
    pub max_parallel_tool_calls: usize,

    #[arg(
        long = "tool-timeout-ms",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Maximum duration of shell and python tool invocations"
    )]
    pub tool_timeout_ms: u64,

    #[arg(
        long = "history-turns",
        default_value_t = 3,
        help = "Prior turns replayed to the completion service as context"
    )]
    pub history_turns: usize,

    #[arg(
        long = "request-timeout-ms",
        default_value_t = 120_000,
        value_parser = parse_positive_u64,
        help = "HTTP timeout for one completion request"
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "request-max-retries",
        default_value_t = 2,
        help = "Retries for transient completion failures"
    )]
    pub request_max_retries: usize,

    #[arg(
        long = "log-stderr",
        help = "Write logs to stderr instead of <data-dir>/logs/sita.log"
    )]
    pub log_stderr: bool,
}
