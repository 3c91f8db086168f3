use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const DEFAULT_LOG_ROTATION_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_LOG_ROTATION_MAX_FILES: usize = 5;

/// Configuration for size-based log rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_LOG_ROTATION_MAX_BYTES,
            max_files: DEFAULT_LOG_ROTATION_MAX_FILES,
        }
    }
}

impl LogRotationPolicy {
    /// Build policy from env vars with safe defaults.
    pub fn from_env() -> Self {
        let max_bytes = std::env::var("SITA_LOG_ROTATION_MAX_BYTES")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_LOG_ROTATION_MAX_BYTES);
        let max_files = std::env::var("SITA_LOG_ROTATION_MAX_FILES")
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_LOG_ROTATION_MAX_FILES);
        Self {
            max_bytes,
            max_files,
        }
    }

    /// Returns true when size-based rotation is enabled.
    pub fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }
}

/// Rotates `path` when it already holds at least `policy.max_bytes`.
///
/// Returns true when a rotation happened. Missing files are left alone so the
/// caller can open a fresh log afterwards.
pub fn rotate_log_if_oversized(path: &Path, policy: LogRotationPolicy) -> Result<bool> {
    if !policy.is_enabled() || !path.exists() {
        return Ok(false);
    }
    let current_size = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if current_size < policy.max_bytes {
        return Ok(false);
    }
    rotate_log_file(path, policy)?;
    Ok(true)
}

fn rotated_backup_path(path: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), index))
}

fn rotate_log_file(path: &Path, policy: LogRotationPolicy) -> Result<()> {
    if policy.max_files <= 1 {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to rotate {}", path.display()))?;
        return Ok(());
    }

    let max_backup_index = policy.max_files.saturating_sub(1);
    for index in (1..=max_backup_index).rev() {
        let source = if index == 1 {
            path.to_path_buf()
        } else {
            rotated_backup_path(path, index.saturating_sub(1))
        };
        if !source.exists() {
            continue;
        }
        let destination = rotated_backup_path(path, index);
        if destination.exists() {
            std::fs::remove_file(&destination).with_context(|| {
                format!("failed to replace rotated log {}", destination.display())
            })?;
        }
        std::fs::rename(&source, &destination).with_context(|| {
            format!(
                "failed to rotate {} to {}",
                source.display(),
                destination.display()
            )
        })?;
    }
    Ok(())
}
