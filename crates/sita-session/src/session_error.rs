use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Persisted data exists but cannot be read back faithfully.
    #[error("session store corrupted at {} ({location}): {reason}", path.display())]
    StoreCorrupted {
        path: PathBuf,
        location: String,
        reason: String,
    },
    #[error("turn sequence {got} rejected for session {session_id}; expected {expected}")]
    SequenceViolation {
        session_id: String,
        expected: u64,
        got: u64,
    },
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("session '{0}' already exists")]
    AlreadyExists(String),
    #[error("unsupported session schema version {found} in {} (supported up to {supported})", path.display())]
    UnsupportedSchemaVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
    #[error("session lock error: {0}")]
    Lock(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SessionError {
    pub(crate) fn corrupted(
        path: impl Into<PathBuf>,
        location: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        SessionError::StoreCorrupted {
            path: path.into(),
            location: location.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SessionError::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the error only concerns one session's persisted data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SessionError::StoreCorrupted { .. } | SessionError::UnsupportedSchemaVersion { .. }
        )
    }
}
