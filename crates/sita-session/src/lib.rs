//! Append-only session store for sita turns.
//!
//! A [`Session`] is an ordered log of [`Turn`]s plus the configuration
//! snapshot captured when it started. [`SessionStore::append`] is the only
//! mutation; everything else reads. Persisted data that cannot be parsed back
//! is reported as [`SessionError::StoreCorrupted`], never silently dropped.
use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod session_error;
mod session_export;
mod session_locking;
mod session_storage;
mod session_types;

pub use session_error::SessionError;
pub use session_export::{render_session, SessionExportFormat};
pub use session_types::{
    generate_session_id, is_valid_session_id, ConfigSnapshot, Session, SessionSummary, Turn,
    TurnMode,
};

use session_locking::acquire_lock;
use session_storage::{
    append_turn_jsonl, append_turn_sqlite, create_session_jsonl, create_session_sqlite,
    list_sessions_jsonl, list_sessions_sqlite, parse_session_jsonl, read_session_jsonl,
    read_session_sqlite, session_exists_sqlite, write_imported_session_sqlite,
};

const SESSION_SCHEMA_VERSION: u32 = 1;
const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;
const DEFAULT_LOCK_STALE_MS: u64 = 30_000;
const SESSIONS_DIR: &str = "sessions";
const SQLITE_FILE: &str = "sessions.sqlite";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStorageBackend {
    Jsonl,
    Sqlite,
}

impl SessionStorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStorageBackend::Jsonl => "jsonl",
            SessionStorageBackend::Sqlite => "sqlite",
        }
    }
}

impl std::str::FromStr for SessionStorageBackend {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "jsonl" => Ok(SessionStorageBackend::Jsonl),
            "sqlite" => Ok(SessionStorageBackend::Sqlite),
            other => Err(format!(
                "unsupported session backend '{other}' (expected jsonl|sqlite)"
            )),
        }
    }
}

/// Durable home of every session under one data directory.
#[derive(Debug)]
pub struct SessionStore {
    data_dir: PathBuf,
    backend: SessionStorageBackend,
    lock_wait_ms: u64,
    lock_stale_ms: u64,
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn open(
        data_dir: impl Into<PathBuf>,
        backend: SessionStorageBackend,
    ) -> Result<Self, SessionError> {
        let data_dir = data_dir.into();
        let sessions_dir = data_dir.join(SESSIONS_DIR);
        fs::create_dir_all(&sessions_dir).map_err(|source| SessionError::Io {
            context: format!("failed to create session directory {}", sessions_dir.display()),
            source,
        })?;
        Ok(Self {
            data_dir,
            backend,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            lock_stale_ms: DEFAULT_LOCK_STALE_MS,
            append_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_lock_policy(&mut self, wait_ms: u64, stale_ms: u64) {
        self.lock_wait_ms = wait_ms.max(1);
        self.lock_stale_ms = stale_ms;
    }

    pub fn backend(&self) -> SessionStorageBackend {
        self.backend
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join(SESSIONS_DIR)
    }

    fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join(SQLITE_FILE)
    }

    fn jsonl_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.jsonl"))
    }

    fn lock_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.lock"))
    }

    /// Where a session's data lives, for diagnostics.
    pub fn session_location(&self, session_id: &str) -> PathBuf {
        match self.backend {
            SessionStorageBackend::Jsonl => self.jsonl_path(session_id),
            SessionStorageBackend::Sqlite => self.sqlite_path(),
        }
    }

    pub fn exists(&self, session_id: &str) -> Result<bool, SessionError> {
        if !is_valid_session_id(session_id) {
            return Ok(false);
        }
        match self.backend {
            SessionStorageBackend::Jsonl => Ok(self.jsonl_path(session_id).exists()),
            SessionStorageBackend::Sqlite => session_exists_sqlite(&self.sqlite_path(), session_id),
        }
    }

    /// Starts and persists an empty session with a fresh id.
    pub fn create(&self, config: ConfigSnapshot) -> Result<Session, SessionError> {
        let created_at = Utc::now();
        for _ in 0..16 {
            let session = Session {
                id: generate_session_id(created_at),
                created_at,
                config: config.clone(),
                turns: Vec::new(),
            };
            let outcome = match self.backend {
                SessionStorageBackend::Jsonl => {
                    create_session_jsonl(&self.jsonl_path(&session.id), &session)
                }
                SessionStorageBackend::Sqlite => {
                    create_session_sqlite(&self.sqlite_path(), &session)
                }
            };
            match outcome {
                Ok(()) => {
                    tracing::info!(
                        session_id = %session.id,
                        backend = self.backend.as_str(),
                        "created session"
                    );
                    return Ok(session);
                }
                Err(SessionError::AlreadyExists(_)) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(SessionError::Lock(
            "could not allocate a unique session id".to_string(),
        ))
    }

    /// Persists `turn` as the next turn of `session`, then adds it in memory.
    ///
    /// Appends to one session are serialized: in-process by a per-session
    /// mutex, across processes by a lock file. The turn's sequence number must
    /// be exactly one past the last persisted turn.
    pub fn append(&self, session: &mut Session, turn: Turn) -> Result<(), SessionError> {
        let expected = session.next_seq();
        if turn.seq != expected {
            return Err(SessionError::SequenceViolation {
                session_id: session.id.clone(),
                expected,
                got: turn.seq,
            });
        }

        let session_lock = self.append_lock(&session.id)?;
        let _in_process = session_lock
            .lock()
            .map_err(|_| SessionError::Lock(format!("append lock poisoned for {}", session.id)))?;
        let _cross_process = acquire_lock(
            &self.lock_path(&session.id),
            Duration::from_millis(self.lock_wait_ms),
            Duration::from_millis(self.lock_stale_ms),
        )?;

        match self.backend {
            SessionStorageBackend::Jsonl => {
                append_turn_jsonl(&self.jsonl_path(&session.id), &session.id, &turn)?
            }
            SessionStorageBackend::Sqlite => {
                append_turn_sqlite(&self.sqlite_path(), &session.id, &turn)?
            }
        }
        tracing::debug!(
            session_id = %session.id,
            seq = turn.seq,
            status = turn.status.as_str(),
            invocations = turn.invocations.len(),
            "appended turn"
        );
        session.turns.push(turn);
        Ok(())
    }

    fn append_lock(&self, session_id: &str) -> Result<Arc<Mutex<()>>, SessionError> {
        let mut locks = self
            .append_locks
            .lock()
            .map_err(|_| SessionError::Lock("append lock table poisoned".to_string()))?;
        Ok(locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Reconstructs a session, including its configuration snapshot.
    pub fn load(&self, session_id: &str) -> Result<Session, SessionError> {
        if !is_valid_session_id(session_id) {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        match self.backend {
            SessionStorageBackend::Jsonl => {
                let path = self.jsonl_path(session_id);
                if !path.exists() {
                    return Err(SessionError::NotFound(session_id.to_string()));
                }
                read_session_jsonl(&path)
            }
            SessionStorageBackend::Sqlite => read_session_sqlite(&self.sqlite_path(), session_id),
        }
    }

    /// Summaries of every readable session, newest first.
    pub fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let mut summaries = match self.backend {
            SessionStorageBackend::Jsonl => list_sessions_jsonl(&self.sessions_dir())?,
            SessionStorageBackend::Sqlite => list_sessions_sqlite(&self.sqlite_path())?,
        };
        summaries.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then_with(|| right.id.cmp(&left.id))
        });
        Ok(summaries)
    }

    /// Read-only rendering of a persisted session.
    pub fn export(
        &self,
        session_id: &str,
        format: SessionExportFormat,
    ) -> Result<String, SessionError> {
        let session = self.load(session_id)?;
        render_session(&session, format)
    }

    /// Persists a session from a JSONL export under its original id.
    pub fn import_jsonl(&self, raw: &str) -> Result<Session, SessionError> {
        let session = parse_session_jsonl(raw, Path::new("<import>"))?;
        if self.exists(&session.id)? {
            return Err(SessionError::AlreadyExists(session.id));
        }
        match self.backend {
            SessionStorageBackend::Jsonl => {
                let path = self.jsonl_path(&session.id);
                create_session_jsonl(&path, &session)?;
                for turn in &session.turns {
                    append_turn_jsonl(&path, &session.id, turn)?;
                }
            }
            SessionStorageBackend::Sqlite => {
                write_imported_session_sqlite(&self.sqlite_path(), &session)?
            }
        }
        tracing::info!(
            session_id = %session.id,
            turns = session.turns.len(),
            "imported session"
        );
        Ok(session)
    }
}
