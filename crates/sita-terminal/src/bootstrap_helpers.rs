use std::{fs::OpenOptions, path::Path, sync::Mutex};

use anyhow::{anyhow, Context, Result};
use sita_core::{rotate_log_if_oversized, LogRotationPolicy};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "sita.log";

fn env_filter() -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    match std::env::var("SITA_LOG") {
        Ok(directives) => builder.parse_lossy(directives),
        Err(_) => builder.from_env_lossy(),
    }
}

/// Logs go to `<data_dir>/logs/sita.log` so they never interleave with the REPL,
/// or to stderr when `log_stderr` is set.
pub fn init_tracing(data_dir: &Path, log_stderr: bool) -> Result<()> {
    if log_stderr {
        return tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .try_init()
            .map_err(|error| anyhow!("failed to initialize tracing: {error}"));
    }

    let logs_dir = data_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("failed to create {}", logs_dir.display()))?;
    let log_path = logs_dir.join(LOG_FILE);
    rotate_log_if_oversized(&log_path, LogRotationPolicy::from_env())?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .compact()
        .try_init()
        .map_err(|error| anyhow!("failed to initialize tracing: {error}"))
}
