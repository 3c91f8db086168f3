//! Lock file lifecycle for cross-process append serialization.
use super::*;

pub(super) struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub(super) fn acquire_lock(
    path: &Path,
    timeout: Duration,
    stale_after: Duration,
) -> Result<LockGuard, SessionError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|error| {
                SessionError::io(
                    format!("failed to create lock directory {}", parent.display()),
                    error,
                )
            })?;
        }
    }

    let start = SystemTime::now();

    loop {
        match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(mut file) => {
                let pid = std::process::id();
                let _ = writeln!(file, "{pid}");
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                });
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                if stale_after > Duration::ZERO && reclaim_stale_lock(path, stale_after) {
                    tracing::warn!(lock = %path.display(), "reclaimed stale session lock");
                    continue;
                }
                let elapsed = SystemTime::now().duration_since(start).unwrap_or_default();
                if elapsed >= timeout {
                    let holder = fs::read_to_string(path)
                        .map(|raw| raw.trim().to_string())
                        .unwrap_or_default();
                    return Err(SessionError::Lock(format!(
                        "timed out acquiring lock {} (held by pid {})",
                        path.display(),
                        if holder.is_empty() { "unknown" } else { holder.as_str() }
                    )));
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(error) => {
                return Err(SessionError::Lock(format!(
                    "failed to acquire lock {}: {error}",
                    path.display()
                )));
            }
        }
    }
}

fn reclaim_stale_lock(path: &Path, stale_after: Duration) -> bool {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return false,
    };
    let modified = match metadata.modified() {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age < stale_after {
        return false;
    }

    fs::remove_file(path).is_ok()
}
