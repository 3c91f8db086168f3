use std::{path::PathBuf, time::Duration};

const SAFE_PROCESS_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "LC_CTYPE", "TERM", "TMPDIR", "TMP", "TEMP",
    "TZ",
];

/// Output captured from a child process is capped at this many bytes per stream.
pub const DEFAULT_MAX_COMMAND_OUTPUT_BYTES: usize = 64 * 1024;
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

/// Limits shared by every built-in tool.
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    /// Roots file tools may touch; empty means unrestricted.
    pub allowed_roots: Vec<PathBuf>,
    pub max_file_read_bytes: usize,
    pub max_file_write_bytes: usize,
    pub max_command_output_bytes: usize,
    pub max_command_length: usize,
    pub max_directory_entries: usize,
    /// Maximum duration for `shell` and `run_python`.
    pub tool_timeout_ms: u64,
    pub shell_program: String,
    pub python_program: String,
    /// Environment variables passed through to child processes.
    pub passthrough_env: Vec<String>,
}

impl ToolPolicy {
    pub fn new(allowed_roots: Vec<PathBuf>) -> Self {
        Self {
            allowed_roots,
            max_file_read_bytes: 1_000_000,
            max_file_write_bytes: 1_000_000,
            max_command_output_bytes: DEFAULT_MAX_COMMAND_OUTPUT_BYTES,
            max_command_length: 4_096,
            max_directory_entries: 1_000,
            tool_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
            shell_program: "sh".to_string(),
            python_program: "python3".to_string(),
            passthrough_env: SAFE_PROCESS_ENV_VARS
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
        }
    }

    pub fn with_tool_timeout_ms(mut self, tool_timeout_ms: u64) -> Self {
        self.tool_timeout_ms = tool_timeout_ms.max(1);
        self
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms.max(1))
    }
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
