//! Session persistence with JSONL and SQLite backends.
use std::io::{Read, Seek, SeekFrom};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::*;

const TAIL_CHUNK_BYTES: u64 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct SessionMetaRecord {
    pub schema_version: u32,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub config: ConfigSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub(super) enum SessionRecord {
    Meta(SessionMetaRecord),
    Turn(Turn),
}

pub(super) fn meta_record(session: &Session) -> SessionRecord {
    SessionRecord::Meta(SessionMetaRecord {
        schema_version: SESSION_SCHEMA_VERSION,
        session_id: session.id.clone(),
        created_at: session.created_at,
        config: session.config.clone(),
    })
}

/// Serializes a full session in the on-disk JSONL layout.
pub(super) fn session_to_jsonl(session: &Session) -> Result<String, SessionError> {
    let mut output = serde_json::to_string(&meta_record(session))?;
    output.push('\n');
    for turn in &session.turns {
        output.push_str(&serde_json::to_string(&SessionRecord::Turn(turn.clone()))?);
        output.push('\n');
    }
    Ok(output)
}

pub(super) fn create_session_jsonl(path: &Path, session: &Session) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|error| {
                SessionError::io(
                    format!("failed to create session directory {}", parent.display()),
                    error,
                )
            })?;
        }
    }
    let mut file = match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(SessionError::AlreadyExists(session.id.clone()))
        }
        Err(error) => {
            return Err(SessionError::io(
                format!("failed to create session file {}", path.display()),
                error,
            ))
        }
    };
    let header = serde_json::to_string(&meta_record(session))?;
    writeln!(file, "{header}")
        .and_then(|_| file.sync_all())
        .map_err(|error| {
            SessionError::io(
                format!("failed to write session header to {}", path.display()),
                error,
            )
        })
}

pub(super) fn append_turn_jsonl(
    path: &Path,
    session_id: &str,
    turn: &Turn,
) -> Result<(), SessionError> {
    let expected = match read_last_record_jsonl(path)? {
        SessionRecord::Meta(_) => 1,
        SessionRecord::Turn(last) => last.seq + 1,
    };
    if turn.seq != expected {
        return Err(SessionError::SequenceViolation {
            session_id: session_id.to_string(),
            expected,
            got: turn.seq,
        });
    }

    let line = serde_json::to_string(&SessionRecord::Turn(turn.clone()))?;
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|error| {
            SessionError::io(
                format!("failed to open session file {}", path.display()),
                error,
            )
        })?;
    writeln!(file, "{line}")
        .and_then(|_| file.sync_all())
        .map_err(|error| {
            SessionError::io(
                format!("failed to append turn to {}", path.display()),
                error,
            )
        })
}

/// Parses only the final non-empty line, scanning backwards from the end.
///
/// Full validation happens on load; appends only need the last sequence.
fn read_last_record_jsonl(path: &Path) -> Result<SessionRecord, SessionError> {
    let open_error = |error| {
        SessionError::io(format!("failed to read session file {}", path.display()), error)
    };
    let mut file = fs::File::open(path).map_err(open_error)?;
    let mut position = file.metadata().map_err(open_error)?.len();
    let mut tail: Vec<u8> = Vec::new();
    let line = loop {
        let content_end = tail
            .iter()
            .rposition(|byte| !byte.is_ascii_whitespace())
            .map_or(0, |index| index + 1);
        let content = &tail[..content_end];
        if let Some(newline) = content.iter().rposition(|byte| *byte == b'\n') {
            break content[newline + 1..].to_vec();
        }
        if position == 0 {
            break content.to_vec();
        }
        let step = position.min(TAIL_CHUNK_BYTES);
        position -= step;
        let mut chunk = vec![0_u8; step as usize];
        file.seek(SeekFrom::Start(position))
            .and_then(|_| file.read_exact(&mut chunk))
            .map_err(open_error)?;
        chunk.extend_from_slice(&tail);
        tail = chunk;
    };
    if line.is_empty() {
        return Err(SessionError::corrupted(path, "line 1", "session file is empty"));
    }
    serde_json::from_slice::<SessionRecord>(&line)
        .map_err(|error| SessionError::corrupted(path, "last line", error.to_string()))
}

pub(super) fn read_session_jsonl(path: &Path) -> Result<Session, SessionError> {
    let file = fs::File::open(path).map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            let id = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            return SessionError::NotFound(id);
        }
        SessionError::io(format!("failed to open session file {}", path.display()), error)
    })?;
    let mut raw = String::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|error| {
            SessionError::corrupted(path, format!("line {}", index + 1), error.to_string())
        })?;
        raw.push_str(&line);
        raw.push('\n');
    }
    let session = parse_session_jsonl(&raw, path)?;
    let expected_id = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    if session.id != expected_id {
        return Err(SessionError::corrupted(
            path,
            "line 1",
            format!("header names session '{}' but file is '{expected_id}'", session.id),
        ));
    }
    Ok(session)
}

/// Parses and validates a JSONL session; `path` is only used in errors.
pub(super) fn parse_session_jsonl(raw: &str, path: &Path) -> Result<Session, SessionError> {
    let mut session: Option<Session> = None;

    for (index, line) in raw.lines().enumerate() {
        let location = format!("line {}", index + 1);
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str::<SessionRecord>(line)
            .map_err(|error| SessionError::corrupted(path, &location, error.to_string()))?;
        match record {
            SessionRecord::Meta(meta) => {
                if session.is_some() {
                    return Err(SessionError::corrupted(
                        path,
                        location,
                        "duplicate session header",
                    ));
                }
                if meta.schema_version > SESSION_SCHEMA_VERSION {
                    return Err(SessionError::UnsupportedSchemaVersion {
                        path: path.to_path_buf(),
                        found: meta.schema_version,
                        supported: SESSION_SCHEMA_VERSION,
                    });
                }
                if !is_valid_session_id(&meta.session_id) {
                    return Err(SessionError::corrupted(
                        path,
                        location,
                        format!("invalid session id '{}'", meta.session_id),
                    ));
                }
                session = Some(Session {
                    id: meta.session_id,
                    created_at: meta.created_at,
                    config: meta.config,
                    turns: Vec::new(),
                });
            }
            SessionRecord::Turn(turn) => {
                let Some(session) = session.as_mut() else {
                    return Err(SessionError::corrupted(
                        path,
                        location,
                        "turn record before session header",
                    ));
                };
                let expected = session.next_seq();
                if turn.seq != expected {
                    return Err(SessionError::corrupted(
                        path,
                        location,
                        format!(
                            "turn sequence {} does not follow {} (expected {expected})",
                            turn.seq,
                            expected - 1
                        ),
                    ));
                }
                session.turns.push(turn);
            }
        }
    }

    session.ok_or_else(|| SessionError::corrupted(path, "line 1", "missing session header"))
}

pub(super) fn list_sessions_jsonl(dir: &Path) -> Result<Vec<SessionSummary>, SessionError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|error| {
        SessionError::io(
            format!("failed to read session directory {}", dir.display()),
            error,
        )
    })?;
    let mut summaries = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|value| value.to_str()) != Some("jsonl") {
            continue;
        }
        match read_session_jsonl(&path) {
            Ok(session) => summaries.push(session.summary()),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "skipping unreadable session")
            }
        }
    }
    Ok(summaries)
}

fn open_session_sqlite_connection(path: &Path) -> Result<Connection, SessionError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|error| {
                SessionError::io(
                    format!("failed to create session directory {}", parent.display()),
                    error,
                )
            })?;
        }
    }
    let connection = Connection::open(path)?;
    connection.busy_timeout(Duration::from_secs(5))?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            schema_version INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            config_json TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS session_turns (
            session_id TEXT NOT NULL REFERENCES sessions(id),
            seq INTEGER NOT NULL,
            turn_json TEXT NOT NULL,
            PRIMARY KEY (session_id, seq)
        );
        "#,
    )?;
    Ok(connection)
}

fn insert_session_row(connection: &Connection, session: &Session) -> Result<(), SessionError> {
    let config_json = serde_json::to_string(&session.config)?;
    let inserted = connection.execute(
        r#"
        INSERT OR IGNORE INTO sessions (id, schema_version, created_at, config_json)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![
            session.id,
            SESSION_SCHEMA_VERSION,
            session.created_at.to_rfc3339(),
            config_json
        ],
    )?;
    if inserted == 0 {
        return Err(SessionError::AlreadyExists(session.id.clone()));
    }
    Ok(())
}

pub(super) fn create_session_sqlite(path: &Path, session: &Session) -> Result<(), SessionError> {
    let connection = open_session_sqlite_connection(path)?;
    insert_session_row(&connection, session)
}

pub(super) fn session_exists_sqlite(path: &Path, session_id: &str) -> Result<bool, SessionError> {
    if !path.exists() {
        return Ok(false);
    }
    let connection = open_session_sqlite_connection(path)?;
    let found: Option<String> = connection
        .query_row(
            "SELECT id FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(super) fn append_turn_sqlite(
    path: &Path,
    session_id: &str,
    turn: &Turn,
) -> Result<(), SessionError> {
    let mut connection = open_session_sqlite_connection(path)?;
    let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let known: Option<String> = transaction
        .query_row(
            "SELECT id FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    if known.is_none() {
        return Err(SessionError::NotFound(session_id.to_string()));
    }
    let last_seq: u64 = transaction.query_row(
        "SELECT COALESCE(MAX(seq), 0) FROM session_turns WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    let expected = last_seq + 1;
    if turn.seq != expected {
        return Err(SessionError::SequenceViolation {
            session_id: session_id.to_string(),
            expected,
            got: turn.seq,
        });
    }
    let turn_json = serde_json::to_string(turn)?;
    transaction.execute(
        "INSERT INTO session_turns (session_id, seq, turn_json) VALUES (?1, ?2, ?3)",
        params![session_id, turn.seq, turn_json],
    )?;
    transaction.commit()?;
    Ok(())
}

pub(super) fn read_session_sqlite(path: &Path, session_id: &str) -> Result<Session, SessionError> {
    if !path.exists() {
        return Err(SessionError::NotFound(session_id.to_string()));
    }
    let connection = open_session_sqlite_connection(path)?;
    let row: Option<(u32, String, String)> = connection
        .query_row(
            "SELECT schema_version, created_at, config_json FROM sessions WHERE id = ?1",
            params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((schema_version, created_at, config_json)) = row else {
        return Err(SessionError::NotFound(session_id.to_string()));
    };
    if schema_version > SESSION_SCHEMA_VERSION {
        return Err(SessionError::UnsupportedSchemaVersion {
            path: path.to_path_buf(),
            found: schema_version,
            supported: SESSION_SCHEMA_VERSION,
        });
    }
    let header_location = format!("session {session_id}");
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| SessionError::corrupted(path, &header_location, error.to_string()))?;
    let config = serde_json::from_str::<ConfigSnapshot>(&config_json)
        .map_err(|error| SessionError::corrupted(path, &header_location, error.to_string()))?;

    let mut statement = connection.prepare(
        r#"
        SELECT seq, turn_json
        FROM session_turns
        WHERE session_id = ?1
        ORDER BY seq ASC
        "#,
    )?;
    let mut rows = statement.query(params![session_id])?;
    let mut session = Session {
        id: session_id.to_string(),
        created_at,
        config,
        turns: Vec::new(),
    };
    while let Some(row) = rows.next()? {
        let seq: u64 = row.get(0)?;
        let turn_json: String = row.get(1)?;
        let location = format!("session {session_id} turn {seq}");
        let turn = serde_json::from_str::<Turn>(&turn_json)
            .map_err(|error| SessionError::corrupted(path, &location, error.to_string()))?;
        let expected = session.next_seq();
        if turn.seq != seq || seq != expected {
            return Err(SessionError::corrupted(
                path,
                location,
                format!("turn sequence {} does not follow {}", turn.seq, expected - 1),
            ));
        }
        session.turns.push(turn);
    }
    Ok(session)
}

pub(super) fn list_sessions_sqlite(path: &Path) -> Result<Vec<SessionSummary>, SessionError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let connection = open_session_sqlite_connection(path)?;
    let mut statement = connection.prepare(
        r#"
        SELECT s.id, s.created_at, s.config_json, COUNT(t.seq)
        FROM sessions s
        LEFT JOIN session_turns t ON t.session_id = s.id
        GROUP BY s.id
        "#,
    )?;
    let mut rows = statement.query([])?;
    let mut summaries = Vec::new();
    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;
        let created_at: String = row.get(1)?;
        let config_json: String = row.get(2)?;
        let turn_count: u64 = row.get(3)?;
        let parsed = DateTime::parse_from_rfc3339(&created_at)
            .map(|value| value.with_timezone(&Utc))
            .ok()
            .zip(serde_json::from_str::<ConfigSnapshot>(&config_json).ok());
        let Some((created_at, config)) = parsed else {
            tracing::warn!(session_id = %id, "skipping unreadable session header");
            continue;
        };
        summaries.push(SessionSummary {
            id,
            created_at,
            turn_count: usize::try_from(turn_count).unwrap_or(usize::MAX),
            provider: config.provider,
            model: config.model,
        });
    }
    Ok(summaries)
}

pub(super) fn write_imported_session_sqlite(
    path: &Path,
    session: &Session,
) -> Result<(), SessionError> {
    let mut connection = open_session_sqlite_connection(path)?;
    let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    insert_session_row(&transaction, session)?;
    for turn in &session.turns {
        let turn_json = serde_json::to_string(turn)?;
        transaction.execute(
            "INSERT INTO session_turns (session_id, seq, turn_json) VALUES (?1, ?2, ?3)",
            params![session.id, turn.seq, turn_json],
        )?;
    }
    transaction.commit()?;
    Ok(())
}
