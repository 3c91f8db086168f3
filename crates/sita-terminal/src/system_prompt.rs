use chrono::{DateTime, Local};
use sita_ai::Provider;

/// Host facts baked into the system prompt and the startup banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub hostname: Option<String>,
}

impl PlatformInfo {
    pub fn detect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: detect_hostname(),
        }
    }

    pub fn describe(&self) -> String {
        match self.hostname.as_deref() {
            Some(hostname) => format!("{} {} ({hostname})", self.os, self.arch),
            None => format!("{} {}", self.os, self.arch),
        }
    }
}

fn detect_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|raw| raw.trim().to_string())
        .filter(|name| !name.is_empty())
}

pub fn compose_system_prompt(
    platform: &PlatformInfo,
    provider: Provider,
    model: &str,
    tool_names: &[String],
    now: DateTime<Local>,
) -> String {
    let tools = if tool_names.is_empty() {
        "none".to_string()
    } else {
        tool_names.join(", ")
    };
    format!(
        "You are sita, an expert system administration assistant running in the operator's terminal.\n\
         \n\
         Host: {platform}\n\
         Completion provider: {provider} ({model})\n\
         Current date and time: {now}\n\
         Available tools: {tools}\n\
         \n\
         You can inspect and manage this machine through the tools above. Your job is to:\n\
         1. Understand the operator's request and run the commands that answer it.\n\
         2. Analyze command output and report what matters.\n\
         3. Give clear, actionable recommendations and suggest follow-up steps when useful.\n\
         \n\
         Rules:\n\
         - Explain what a command does before relying on its output.\n\
         - Warn before any destructive or irreversible operation and prefer read-only checks.\n\
         - Be concise but thorough.\n\
         - Format answers as markdown with short sections.",
        platform = platform.describe(),
        provider = provider.display_name(),
        now = now.format("%Y-%m-%d %H:%M:%S %Z"),
    )
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeZone};
    use sita_ai::Provider;

    use super::{compose_system_prompt, PlatformInfo};

    #[test]
    fn unit_prompt_names_host_provider_and_time() {
        let platform = PlatformInfo {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            hostname: Some("bastion".to_string()),
        };
        let now = Local
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 0)
            .single()
            .expect("unambiguous local time");
        let prompt = compose_system_prompt(
            &platform,
            Provider::OpenAi,
            "gpt-4o-mini",
            &["shell".to_string(), "think".to_string()],
            now,
        );
        assert!(prompt.contains("linux x86_64 (bastion)"));
        assert!(prompt.contains("gpt-4o-mini"));
        assert!(prompt.contains("2024-03-09 14:05:00"));
        assert!(prompt.contains("shell, think"));
        assert!(prompt.contains("Warn before any destructive"));
    }

    #[test]
    fn unit_platform_without_hostname() {
        let platform = PlatformInfo {
            os: "macos".to_string(),
            arch: "aarch64".to_string(),
            hostname: None,
        };
        assert_eq!(platform.describe(), "macos aarch64");
    }
}
