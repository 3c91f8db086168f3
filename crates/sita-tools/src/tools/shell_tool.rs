use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde_json::{json, Value};
use sita_agent_core::{AgentTool, ToolContract, ToolExecutionResult};

use super::{
    required_string, resolve_and_validate_path, run_process, optional_string, PathMode,
    ToolPolicy,
};

fn process_result_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "exit_code": { "type": ["integer", "null"] },
            "stdout": { "type": "string" },
            "stderr": { "type": "string" },
            "elapsed_ms": { "type": "integer", "minimum": 0 }
        },
        "required": ["exit_code", "stdout", "stderr", "elapsed_ms"]
    })
}

/// First word of a command line, used for logging only.
pub(super) fn leading_executable(command: &str) -> Option<String> {
    let words = shell_words::split(command).ok()?;
    let first = words.into_iter().next()?;
    let name = first.rsplit('/').next().unwrap_or(first.as_str()).to_string();
    Some(name)
}

/// Runs an arbitrary command line through the configured shell.
pub struct ShellTool {
    policy: Arc<ToolPolicy>,
}

impl ShellTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AgentTool for ShellTool {
    fn contract(&self) -> ToolContract {
        ToolContract {
            name: "shell".to_string(),
            description: "Execute a shell command on the local system and return its exit code and output"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "minLength": 1, "description": "Command line to run" },
                    "cwd": { "type": "string", "description": "Optional working directory" }
                },
                "required": ["command"],
                "additionalProperties": false
            }),
            result_schema: process_result_schema(),
            max_duration: self.policy.tool_timeout(),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let command = match required_string(&arguments, "command") {
            Ok(command) => command,
            Err(error) => return ToolExecutionResult::error(json!({ "error": error })),
        };
        if command.trim().is_empty() {
            return ToolExecutionResult::error(json!({
                "command": command,
                "error": "command must not be empty",
            }));
        }
        if command.len() > self.policy.max_command_length {
            return ToolExecutionResult::error(json!({
                "command": command,
                "error": format!(
                    "command is too long ({} bytes), limit is {} bytes",
                    command.len(),
                    self.policy.max_command_length
                ),
            }));
        }

        let cwd: Option<PathBuf> = match optional_string(&arguments, "cwd") {
            Some(cwd) => match resolve_and_validate_path(&cwd, &self.policy, PathMode::Directory) {
                Ok(path) => Some(path),
                Err(error) => {
                    return ToolExecutionResult::error(json!({
                        "command": command,
                        "cwd": cwd,
                        "error": error,
                    }))
                }
            },
            None => None,
        };

        tracing::debug!(
            executable = leading_executable(&command).as_deref().unwrap_or("<unparsed>"),
            "running shell command"
        );
        let output = match run_process(
            &self.policy.shell_program,
            &["-c", command.as_str()],
            cwd.as_deref(),
            &self.policy,
        )
        .await
        {
            Ok(output) => output,
            Err(error) => {
                return ToolExecutionResult::error(json!({
                    "command": command,
                    "cwd": cwd.as_ref().map(|path| path.display().to_string()),
                    "error": error,
                }))
            }
        };

        let mut payload = json!({
            "command": command,
            "cwd": cwd.as_ref().map(|path| path.display().to_string()),
            "exit_code": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
            "elapsed_ms": output.elapsed_ms,
        });
        if output.success {
            ToolExecutionResult::ok(payload)
        } else {
            payload["error"] = json!(match output.exit_code {
                Some(code) => format!("command exited with status {code}"),
                None => "command terminated by signal".to_string(),
            });
            ToolExecutionResult::error(payload)
        }
    }
}

/// Evaluates a Python snippet with `python3 -c`.
pub struct RunPythonTool {
    policy: Arc<ToolPolicy>,
}

impl RunPythonTool {
    pub fn new(policy: Arc<ToolPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AgentTool for RunPythonTool {
    fn contract(&self) -> ToolContract {
        ToolContract {
            name: "run_python".to_string(),
            description: "Run a Python 3 snippet and return its exit code and output; print results to stdout"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "code": { "type": "string", "minLength": 1 }
                },
                "required": ["code"],
                "additionalProperties": false
            }),
            result_schema: process_result_schema(),
            max_duration: self.policy.tool_timeout(),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let code = match required_string(&arguments, "code") {
            Ok(code) => code,
            Err(error) => return ToolExecutionResult::error(json!({ "error": error })),
        };

        let output = match run_process(
            &self.policy.python_program,
            &["-c", code.as_str()],
            None,
            &self.policy,
        )
        .await
        {
            Ok(output) => output,
            Err(error) => return ToolExecutionResult::error(json!({ "error": error })),
        };

        let mut payload = json!({
            "exit_code": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
            "elapsed_ms": output.elapsed_ms,
        });
        if output.success {
            ToolExecutionResult::ok(payload)
        } else {
            let last_line = output
                .stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("python exited with a failure status")
                .to_string();
            payload["error"] = json!(last_line);
            ToolExecutionResult::error(payload)
        }
    }
}
