use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use sita_agent_core::{AgentTool, ToolContract, ToolExecutionResult};

use super::{run_process, ToolPolicy};

const SYSTEM_FACT_MAX_DURATION: Duration = Duration::from_secs(10);

/// Quick-query phrases and the single tool each one resolves to.
pub const QUICK_QUERY_VOCABULARY: &[(&str, &str)] = &[
    ("specs", "system_specs"),
    ("system specs", "system_specs"),
    ("hardware", "system_specs"),
    ("interfaces", "network_interfaces"),
    ("network", "network_interfaces"),
    ("ip", "network_interfaces"),
    ("services", "running_services"),
    ("running services", "running_services"),
    ("disk", "disk_usage"),
    ("disk usage", "disk_usage"),
    ("storage", "disk_usage"),
    ("status", "system_status"),
    ("system status", "system_status"),
];

/// Maps a `?` payload onto its fixed tool, ignoring case and extra whitespace.
pub fn resolve_quick_query(payload: &str) -> Option<&'static str> {
    let normalized = payload
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    QUICK_QUERY_VOCABULARY
        .iter()
        .find(|(phrase, _)| *phrase == normalized)
        .map(|(_, tool)| *tool)
}

/// Human-readable listing of the accepted quick-query phrases.
pub fn quick_query_help() -> String {
    let mut lines = Vec::new();
    let mut current_tool = "";
    for (phrase, tool) in QUICK_QUERY_VOCABULARY {
        if *tool != current_tool {
            lines.push(format!("  {tool}:"));
            current_tool = *tool;
        }
        if let Some(last) = lines.last_mut() {
            last.push(' ');
            last.push_str(phrase);
            last.push(',');
        }
    }
    lines
        .into_iter()
        .map(|line| line.trim_end_matches(',').to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemFact {
    Specs,
    NetworkInterfaces,
    RunningServices,
    DiskUsage,
    Status,
}

impl SystemFact {
    pub const ALL: [SystemFact; 5] = [
        SystemFact::Specs,
        SystemFact::NetworkInterfaces,
        SystemFact::RunningServices,
        SystemFact::DiskUsage,
        SystemFact::Status,
    ];

    pub fn tool_name(self) -> &'static str {
        match self {
            SystemFact::Specs => "system_specs",
            SystemFact::NetworkInterfaces => "network_interfaces",
            SystemFact::RunningServices => "running_services",
            SystemFact::DiskUsage => "disk_usage",
            SystemFact::Status => "system_status",
        }
    }

    fn description(self) -> &'static str {
        match self {
            SystemFact::Specs => "Report kernel, CPU and memory details of this machine",
            SystemFact::NetworkInterfaces => "List network interfaces and their addresses",
            SystemFact::RunningServices => "List services currently running on this machine",
            SystemFact::DiskUsage => "Report mounted filesystem usage (df -h)",
            SystemFact::Status => "Summarize uptime, memory, disk and the busiest processes",
        }
    }

    /// Fixed command lines run for this fact on the current platform.
    pub fn commands(self) -> &'static [&'static str] {
        if cfg!(target_os = "macos") {
            match self {
                SystemFact::Specs => &[
                    "uname -a",
                    "sysctl -n machdep.cpu.brand_string",
                    "sysctl -n hw.ncpu hw.memsize",
                ],
                SystemFact::NetworkInterfaces => &["ifconfig"],
                SystemFact::RunningServices => &["launchctl list | head -40"],
                SystemFact::DiskUsage => &["df -h"],
                SystemFact::Status => &["uptime", "vm_stat", "df -h", "ps aux -r | head -10"],
            }
        } else {
            match self {
                SystemFact::Specs => &["uname -a", "lscpu | head -20", "free -h"],
                SystemFact::NetworkInterfaces => &["ip addr show"],
                SystemFact::RunningServices => {
                    &["systemctl list-units --type=service --state=running --no-pager --no-legend"]
                }
                SystemFact::DiskUsage => &["df -h"],
                SystemFact::Status => &[
                    "uptime",
                    "free -h",
                    "df -h",
                    "ps aux --sort=-%cpu | head -10",
                ],
            }
        }
    }
}

/// Runs a fixed set of read-only commands; takes no arguments.
pub struct SystemFactTool {
    fact: SystemFact,
    policy: Arc<ToolPolicy>,
}

impl SystemFactTool {
    pub fn new(fact: SystemFact, policy: Arc<ToolPolicy>) -> Self {
        Self { fact, policy }
    }
}

#[async_trait]
impl AgentTool for SystemFactTool {
    fn contract(&self) -> ToolContract {
        ToolContract {
            name: self.fact.tool_name().to_string(),
            description: self.fact.description().to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
            result_schema: json!({
                "type": "object",
                "properties": {
                    "report": { "type": "string" },
                    "sections": { "type": "array", "minItems": 1 }
                },
                "required": ["report", "sections"]
            }),
            max_duration: SYSTEM_FACT_MAX_DURATION,
        }
    }

    async fn execute(&self, _arguments: Value) -> ToolExecutionResult {
        let mut sections = Vec::new();
        let mut report = String::new();
        let mut failures = 0usize;

        for command in self.fact.commands() {
            let section = match run_process(
                &self.policy.shell_program,
                &["-c", *command],
                None,
                &self.policy,
            )
            .await
            {
                Ok(output) => {
                    if !output.success {
                        failures += 1;
                    }
                    let text = if output.success || output.stderr.trim().is_empty() {
                        output.stdout
                    } else {
                        output.stderr
                    };
                    json!({
                        "command": command,
                        "exit_code": output.exit_code,
                        "output": text,
                    })
                }
                Err(error) => {
                    failures += 1;
                    json!({
                        "command": command,
                        "exit_code": Value::Null,
                        "output": error,
                    })
                }
            };
            if self.fact.commands().len() > 1 {
                report.push_str(&format!("$ {command}\n"));
            }
            report.push_str(section["output"].as_str().unwrap_or_default().trim_end());
            report.push_str("\n\n");
            sections.push(section);
        }

        let payload = json!({
            "report": report.trim_end().to_string(),
            "sections": sections,
        });
        if failures == self.fact.commands().len() {
            let mut payload = payload;
            payload["error"] = json!(format!(
                "all {} command(s) for {} failed",
                failures,
                self.fact.tool_name()
            ));
            return ToolExecutionResult::error(payload);
        }
        ToolExecutionResult::ok(payload)
    }
}
