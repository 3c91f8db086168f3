use std::{fs, path::Path};

use assert_cmd::Command;
use httpmock::prelude::*;
use predicates::prelude::*;
use serde_json::json;
use tempfile::tempdir;

fn binary_command(data_dir: &Path) -> Command {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("sita"));
    for name in [
        "SITA_PROVIDER",
        "SITA_MODEL",
        "SITA_API_BASE",
        "SITA_DATA_DIR",
        "SITA_SESSION_BACKEND",
        "SITA_LOG",
        "OPENAI_API_KEY",
        "OPENROUTER_API_KEY",
        "GOOGLE_API_KEY",
        "TOGETHER_API_KEY",
    ] {
        command.env_remove(name);
    }
    command.arg("--data-dir").arg(data_dir);
    command
}

fn first_session_id(data_dir: &Path) -> String {
    let output = binary_command(data_dir)
        .arg("--list-sessions")
        .output()
        .expect("list sessions");
    assert!(output.status.success());
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
        .expect("at least one session")
}

fn openai_tool_call(command: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {
                        "name": "shell",
                        "arguments": json!({ "command": command }).to_string()
                    }
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": { "prompt_tokens": 30, "completion_tokens": 6, "total_tokens": 36 }
    })
}

fn openai_text(text: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 50, "completion_tokens": 9, "total_tokens": 59 }
    })
}

#[test]
fn unit_help_lists_core_flags() {
    let temp = tempdir().expect("tempdir");
    binary_command(temp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--data-dir"))
        .stdout(predicate::str::contains("--session-backend"));
}

#[test]
fn regression_out_of_range_temperature_is_rejected() {
    let temp = tempdir().expect("tempdir");
    binary_command(temp.path())
        .args(["--temperature", "3.5", "-c", "!echo hi"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("temperature"));
}

#[cfg(unix)]
#[test]
fn integration_one_shot_shell_turn_prints_output_and_persists() {
    let temp = tempdir().expect("tempdir");
    binary_command(temp.path())
        .args(["-c", "!echo sita-shell-ok"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sita-shell-ok"));

    assert!(temp.path().join("sita.db").exists());
    binary_command(temp.path())
        .arg("--list-sessions")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 turns"));
}

#[cfg(unix)]
#[test]
fn integration_failing_shell_command_exits_non_zero() {
    let temp = tempdir().expect("tempdir");
    binary_command(temp.path())
        .args(["-c", "!exit 3"])
        .assert()
        .code(1);
}

#[test]
fn functional_unknown_quick_query_lists_vocabulary() {
    let temp = tempdir().expect("tempdir");
    binary_command(temp.path())
        .args(["-c", "?weather"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("disk usage"));
}

#[test]
fn functional_agent_turn_without_api_key_fails_cleanly() {
    let temp = tempdir().expect("tempdir");
    binary_command(temp.path())
        .args(["-c", "why is the load high?"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("OPENAI_API_KEY"));
}

#[cfg(unix)]
#[test]
fn integration_agent_turn_runs_tool_round_against_mock_provider() {
    let server = MockServer::start();
    let first = server.mock(|when, then| {
        when.method(POST)
            .path("/chat/completions")
            .body_excludes("\"role\":\"tool\"");
        then.status(200)
            .json_body(openai_tool_call("echo disk-check"));
    });
    let second = server.mock(|when, then| {
        when.method(POST)
            .path("/chat/completions")
            .body_includes("\"role\":\"tool\"")
            .body_includes("disk-check");
        then.status(200)
            .json_body(openai_text("Disk usage looks healthy."));
    });

    let temp = tempdir().expect("tempdir");
    binary_command(temp.path())
        .env("OPENAI_API_KEY", "sk-test-key-123456")
        .args(["--api-base", &server.base_url(), "-c", "analyze disk usage"])
        .assert()
        .success()
        .stdout(predicate::str::contains("healthy"));

    first.assert_calls(1);
    second.assert_calls(1);

    let session_id = first_session_id(temp.path());
    let raw = fs::read_to_string(
        temp.path()
            .join("sessions")
            .join(format!("{session_id}.jsonl")),
    )
    .expect("session file");
    assert!(raw.contains("\"rounds\":2"));
    assert!(raw.contains("echo disk-check"));
}

#[cfg(unix)]
fn config_value(stdout: &[u8], key: &str) -> Option<String> {
    String::from_utf8_lossy(stdout).lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        (parts.next() == Some(key)).then(|| parts.collect::<Vec<_>>().join(" "))
    })
}

#[test]
fn regression_config_set_does_not_persist_run_overrides() {
    let temp = tempdir().expect("tempdir");
    binary_command(temp.path())
        .args(["--provider", "together", "--temperature", "0.1"])
        .args(["-c", "config set ui.markdown false"])
        .assert()
        .success()
        .stdout(predicate::str::contains("set ui.markdown = false"));

    let output = binary_command(temp.path())
        .args(["-c", "config"])
        .output()
        .expect("show config");
    assert!(output.status.success());
    assert_eq!(config_value(&output.stdout, "ui.markdown").as_deref(), Some("false"));
    assert_eq!(config_value(&output.stdout, "agent.provider").as_deref(), Some("openai"));
    assert_eq!(config_value(&output.stdout, "agent.temperature").as_deref(), Some("0.7"));
}

#[test]
fn integration_piped_repl_runs_lines_until_exit() {
    let temp = tempdir().expect("tempdir");
    binary_command(temp.path())
        .write_stdin("!echo repl-line-ok\n\nhistory\nexit\n!echo never-runs\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("repl-line-ok"))
        .stdout(predicate::str::contains("Goodbye."))
        .stdout(predicate::str::contains("never-runs").not());
}

#[cfg(unix)]
#[test]
fn integration_exported_session_imports_into_sqlite_store() {
    let source = tempdir().expect("source");
    binary_command(source.path())
        .args(["-c", "!echo carried-over"])
        .assert()
        .success();
    let session_id = first_session_id(source.path());

    let exported = binary_command(source.path())
        .args(["--export-session", &session_id, "--export-format", "jsonl"])
        .output()
        .expect("export");
    assert!(exported.status.success());
    let export_path = source.path().join("export.jsonl");
    fs::write(&export_path, &exported.stdout).expect("write export");

    let target = tempdir().expect("target");
    binary_command(target.path())
        .args(["--session-backend", "sqlite", "--import-session"])
        .arg(&export_path)
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("imported session {session_id}")));

    binary_command(target.path())
        .args(["--session-backend", "sqlite", "--export-session", &session_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("carried-over"));

    binary_command(target.path())
        .args(["--session-backend", "sqlite", "--import-session"])
        .arg(&export_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}
