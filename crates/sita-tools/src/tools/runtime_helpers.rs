use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Instant,
};

use serde_json::Value;
use tokio::process::Command;

use super::ToolPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PathMode {
    Read,
    Write,
    Directory,
}

pub(super) fn resolve_and_validate_path(
    user_path: &str,
    policy: &ToolPolicy,
    mode: PathMode,
) -> Result<PathBuf, String> {
    if user_path.trim().is_empty() {
        return Err("path must not be empty".to_string());
    }
    let cwd = std::env::current_dir().map_err(|error| format!("failed to resolve cwd: {error}"))?;
    let input = PathBuf::from(user_path);
    let absolute = if input.is_absolute() {
        input
    } else {
        cwd.join(input)
    };

    let canonical = canonicalize_best_effort(&absolute).map_err(|error| {
        format!(
            "failed to canonicalize path '{}': {error}",
            absolute.display()
        )
    })?;

    if !is_path_allowed(&canonical, policy)? {
        return Err(format!(
            "path '{}' is outside allowed roots",
            canonical.display()
        ));
    }

    if matches!(mode, PathMode::Read | PathMode::Directory) && !absolute.exists() {
        return Err(format!("path '{}' does not exist", absolute.display()));
    }

    match mode {
        PathMode::Read if !absolute.is_file() => Err(format!(
            "path '{}' must be a regular file for this operation",
            absolute.display()
        )),
        PathMode::Directory if !absolute.is_dir() => Err(format!(
            "path '{}' must be a directory for this operation",
            absolute.display()
        )),
        PathMode::Write if absolute.is_dir() => Err(format!(
            "path '{}' is a directory and cannot be overwritten",
            absolute.display()
        )),
        _ => Ok(absolute),
    }
}

pub(super) fn is_path_allowed(path: &Path, policy: &ToolPolicy) -> Result<bool, String> {
    if policy.allowed_roots.is_empty() {
        return Ok(true);
    }

    for root in &policy.allowed_roots {
        let canonical_root = canonicalize_best_effort(root)
            .map_err(|error| format!("invalid allowed root '{}': {error}", root.display()))?;
        if path.starts_with(&canonical_root) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Canonicalizes the longest existing ancestor and re-appends the missing tail.
pub(super) fn canonicalize_best_effort(path: &Path) -> std::io::Result<PathBuf> {
    if path.exists() {
        return std::fs::canonicalize(path);
    }

    let mut missing_suffix: Vec<OsString> = Vec::new();
    let mut cursor = path;
    while !cursor.exists() {
        if let Some(file_name) = cursor.file_name() {
            missing_suffix.push(file_name.to_os_string());
        }
        cursor = match cursor.parent() {
            Some(parent) => parent,
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no existing ancestor for path",
                ));
            }
        };
    }

    let mut canonical = std::fs::canonicalize(cursor)?;
    for component in missing_suffix.iter().rev() {
        canonical.push(component);
    }
    Ok(canonical)
}

pub(super) fn required_string(arguments: &Value, key: &str) -> Result<String, String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.to_string())
        .ok_or_else(|| format!("missing required string argument '{key}'"))
}

pub(super) fn optional_string(arguments: &Value, key: &str) -> Option<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

pub(super) fn truncate_bytes(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        return value.to_string();
    }

    if limit == 0 {
        return "<output truncated>".to_string();
    }

    let mut end = limit.min(value.len());
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }

    let mut output = value[..end].to_string();
    output.push_str("\n<output truncated>");
    output
}

/// Captured result of one child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
}

/// Spawns `program` with a scrubbed environment and waits for it.
///
/// The child is killed if the returned future is dropped, which is how the
/// registry's per-invocation timeout reclaims a stuck process.
pub(super) async fn run_process(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    policy: &ToolPolicy,
) -> Result<ProcessOutput, String> {
    let mut command = Command::new(program);
    command.args(args);
    command.kill_on_drop(true);
    command.stdin(std::process::Stdio::null());
    command.env_clear();
    for key in &policy.passthrough_env {
        if let Ok(value) = std::env::var(key) {
            command.env(key, value);
        }
    }
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let started = Instant::now();
    let output = command
        .output()
        .await
        .map_err(|error| format!("failed to spawn '{program}': {error}"))?;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    Ok(ProcessOutput {
        exit_code: output.status.code(),
        success: output.status.success(),
        stdout: truncate_bytes(
            &String::from_utf8_lossy(&output.stdout),
            policy.max_command_output_bytes,
        ),
        stderr: truncate_bytes(
            &String::from_utf8_lossy(&output.stderr),
            policy.max_command_output_bytes,
        ),
        elapsed_ms,
    })
}
