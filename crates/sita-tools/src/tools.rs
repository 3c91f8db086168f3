use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use sita_agent_core::{AgentTool, RegistryError, ToolContract, ToolExecutionResult, ToolRegistry};

mod runtime_helpers;
mod shell_tool;
mod system_tools;
mod tool_policy;


use runtime_helpers::{
    optional_string, required_string, resolve_and_validate_path, run_process, PathMode,
};
pub use shell_tool::{RunPythonTool, ShellTool};
pub use system_tools::{
    quick_query_help, resolve_quick_query, SystemFact, SystemFactTool, QUICK_QUERY_VOCABULARY,
};
pub use tool_policy::{ToolPolicy, DEFAULT_MAX_COMMAND_OUTPUT_BYTES, DEFAULT_TOOL_TIMEOUT_MS};

const FILE_TOOL_MAX_DURATION: Duration = Duration::from_secs(5);
const THINK_TOOL_MAX_DURATION: Duration = Duration::from_secs(1);

/// Names of every tool [`register_builtin_tools`] installs, in registration order.
pub fn builtin_tool_names() -> Vec<&'static str> {
    let mut names = vec![
        "shell",
        "read_file",
        "list_directory",
        "write_file",
        "run_python",
        "think",
    ];
    names.extend(SystemFact::ALL.iter().map(|fact| fact.tool_name()));
    names
}

/// Registers the built-in tool set once at startup.
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    policy: ToolPolicy,
) -> Result<(), RegistryError> {
    let policy = Arc::new(policy);
    registry.register(Arc::new(ShellTool::new(policy.clone())))?;
    registry.register(Arc::new(ReadFileTool::new(policy.clone())))?;
    registry.register(Arc::new(ListDirectoryTool::new(policy.clone())))?;
    registry.register(Arc::new(WriteFileTool::new(policy.clone())))?;
    registry.register(Arc::new(RunPythonTool::new(policy.clone())))?;
    registry.register(Arc::new(ThinkTool))?;
    for fact in SystemFact::ALL {
        registry.register(Arc::new(SystemFactTool::new(fact, policy.clone())))?;
    }
    Ok(())
}

/// Reads at most `limit + 1` bytes so truncation is detectable without
/// loading the whole file. Also returns the size reported by metadata.
async fn read_prefix(path: &Path, limit: usize) -> std::io::Result<(Vec<u8>, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let reported_len = file.metadata().await?.len();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut raw = Vec::new();
    file.take(cap).read_to_end(&mut raw).await?;
    Ok((raw, reported_len))
}

fn path_error(path: &Path, error: impl Into<String>) -> ToolExecutionResult {
    ToolExecutionResult::error(json!({
        "path": path.display().to_string(),
        "error": error.into(),
    }))
}

/// Reads a UTF-8 (lossy) text file, bounded by `max_bytes`.
pub struct ReadFileTool {
    policy: Arc<ToolPolicy>,
}

impl ReadFileTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AgentTool for ReadFileTool {
    fn contract(&self) -> ToolContract {
        ToolContract {
            name: "read_file".to_string(),
            description: "Read a text file from disk".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path to read" },
                    "max_bytes": { "type": "integer", "minimum": 1 }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
            result_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "bytes": { "type": "integer", "minimum": 0 },
                    "content": { "type": "string" },
                    "truncated": { "type": "boolean" }
                },
                "required": ["path", "bytes", "content", "truncated"]
            }),
            max_duration: FILE_TOOL_MAX_DURATION,
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let path = match required_string(&arguments, "path") {
            Ok(path) => path,
            Err(error) => return ToolExecutionResult::error(json!({ "error": error })),
        };
        let limit = arguments
            .get("max_bytes")
            .and_then(Value::as_u64)
            .map(|value| usize::try_from(value).unwrap_or(usize::MAX))
            .unwrap_or(self.policy.max_file_read_bytes)
            .min(self.policy.max_file_read_bytes);

        let resolved = match resolve_and_validate_path(&path, &self.policy, PathMode::Read) {
            Ok(path) => path,
            Err(error) => {
                return ToolExecutionResult::error(json!({ "path": path, "error": error }))
            }
        };

        let (raw, reported_len) = match read_prefix(&resolved, limit).await {
            Ok(read) => read,
            Err(error) => return path_error(&resolved, error.to_string()),
        };
        // Pseudo files such as /proc entries report a length of 0.
        let total = reported_len.max(raw.len() as u64);
        let truncated = raw.len() > limit;
        let content = String::from_utf8_lossy(&raw[..raw.len().min(limit)]).into_owned();

        ToolExecutionResult::ok(json!({
            "path": resolved.display().to_string(),
            "bytes": total,
            "content": content,
            "truncated": truncated,
        }))
    }
}

/// Lists the immediate entries of a directory, sorted by name.
pub struct ListDirectoryTool {
    policy: Arc<ToolPolicy>,
}

impl ListDirectoryTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AgentTool for ListDirectoryTool {
    fn contract(&self) -> ToolContract {
        ToolContract {
            name: "list_directory".to_string(),
            description: "List files and directories at a path".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
            result_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "entries": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["name", "kind", "bytes"]
                        }
                    }
                },
                "required": ["path", "entries"]
            }),
            max_duration: FILE_TOOL_MAX_DURATION,
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let path = match required_string(&arguments, "path") {
            Ok(path) => path,
            Err(error) => return ToolExecutionResult::error(json!({ "error": error })),
        };
        let resolved = match resolve_and_validate_path(&path, &self.policy, PathMode::Directory) {
            Ok(path) => path,
            Err(error) => {
                return ToolExecutionResult::error(json!({ "path": path, "error": error }))
            }
        };

        let mut reader = match tokio::fs::read_dir(&resolved).await {
            Ok(reader) => reader,
            Err(error) => return path_error(&resolved, error.to_string()),
        };
        let mut entries = Vec::new();
        loop {
            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => return path_error(&resolved, error.to_string()),
            };
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(_) => continue,
            };
            let kind = if file_type.is_symlink() {
                "symlink"
            } else if file_type.is_dir() {
                "dir"
            } else if file_type.is_file() {
                "file"
            } else {
                "other"
            };
            let bytes = if file_type.is_file() {
                entry.metadata().await.map(|meta| meta.len()).unwrap_or(0)
            } else {
                0
            };
            entries.push((entry.file_name().to_string_lossy().into_owned(), kind, bytes));
        }
        entries.sort_by(|left, right| left.0.cmp(&right.0));
        let truncated = entries.len() > self.policy.max_directory_entries;
        entries.truncate(self.policy.max_directory_entries);

        ToolExecutionResult::ok(json!({
            "path": resolved.display().to_string(),
            "entries": entries
                .into_iter()
                .map(|(name, kind, bytes)| json!({ "name": name, "kind": kind, "bytes": bytes }))
                .collect::<Vec<_>>(),
            "truncated": truncated,
        }))
    }
}

/// Writes text to disk, creating parent directories when needed.
pub struct WriteFileTool {
    policy: Arc<ToolPolicy>,
}

impl WriteFileTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AgentTool for WriteFileTool {
    fn contract(&self) -> ToolContract {
        ToolContract {
            name: "write_file".to_string(),
            description: "Write UTF-8 text to a file, creating parent directories if needed"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"],
                "additionalProperties": false
            }),
            result_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "bytes_written": { "type": "integer", "minimum": 0 }
                },
                "required": ["path", "bytes_written"]
            }),
            max_duration: FILE_TOOL_MAX_DURATION,
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let path = match required_string(&arguments, "path") {
            Ok(path) => path,
            Err(error) => return ToolExecutionResult::error(json!({ "error": error })),
        };
        let content = match required_string(&arguments, "content") {
            Ok(content) => content,
            Err(error) => return ToolExecutionResult::error(json!({ "error": error })),
        };
        if content.len() > self.policy.max_file_write_bytes {
            return ToolExecutionResult::error(json!({
                "path": path,
                "error": format!(
                    "content is too large ({} bytes), limit is {} bytes",
                    content.len(),
                    self.policy.max_file_write_bytes
                ),
            }));
        }

        let resolved: PathBuf =
            match resolve_and_validate_path(&path, &self.policy, PathMode::Write) {
                Ok(path) => path,
                Err(error) => {
                    return ToolExecutionResult::error(json!({ "path": path, "error": error }))
                }
            };

        if let Some(parent) = resolved.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(error) = tokio::fs::create_dir_all(parent).await {
                    return path_error(
                        &resolved,
                        format!("failed to create parent directory: {error}"),
                    );
                }
            }
        }

        match tokio::fs::write(&resolved, content.as_bytes()).await {
            Ok(()) => ToolExecutionResult::ok(json!({
                "path": resolved.display().to_string(),
                "bytes_written": content.len(),
            })),
            Err(error) => path_error(&resolved, error.to_string()),
        }
    }
}

/// Scratchpad for intermediate reasoning; records the thought and nothing else.
pub struct ThinkTool;

#[async_trait]
impl AgentTool for ThinkTool {
    fn contract(&self) -> ToolContract {
        ToolContract {
            name: "think".to_string(),
            description: "Record a reasoning step before acting; has no side effects".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "thought": { "type": "string", "minLength": 1 }
                },
                "required": ["thought"],
                "additionalProperties": false
            }),
            result_schema: json!({
                "type": "object",
                "properties": {
                    "recorded": { "const": true },
                    "thought": { "type": "string" }
                },
                "required": ["recorded", "thought"]
            }),
            max_duration: THINK_TOOL_MAX_DURATION,
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        match required_string(&arguments, "thought") {
            Ok(thought) => ToolExecutionResult::ok(json!({ "recorded": true, "thought": thought })),
            Err(error) => ToolExecutionResult::error(json!({ "error": error })),
        }
    }
}
