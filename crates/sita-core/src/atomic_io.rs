use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::time_utils::current_unix_timestamp_ms;

/// Writes `content` to `path` so readers see either the old file or the whole new one.
///
/// The text goes to a hidden sibling temp file, is flushed to disk, then
/// renamed over the destination. Missing parent directories are created.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        bail!("destination path '{}' has no file name", path.display());
    };
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let staging = staging_path(dir, file_name);
    let written = File::create(&staging)
        .and_then(|mut file| {
            file.write_all(content.as_bytes())?;
            file.sync_all()
        })
        .with_context(|| format!("failed to stage {}", staging.display()));
    let renamed = written.and_then(|()| {
        fs::rename(&staging, path)
            .with_context(|| format!("failed to move staged file into {}", path.display()))
    });
    if renamed.is_err() {
        let _ = fs::remove_file(&staging);
    }
    renamed
}

fn staging_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!(
        ".{file_name}.{}-{}.tmp",
        std::process::id(),
        current_unix_timestamp_ms()
    ))
}
