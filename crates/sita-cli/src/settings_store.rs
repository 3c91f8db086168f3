use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection};

use crate::ConfigError;

const SETTINGS_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed `key -> value` store for persisted settings.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Opens (creating if needed) the settings database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                context: format!("failed to create settings directory {}", parent.display()),
                source,
            })?;
        }
        let store = Self { path };
        let connection = store.connection()?;
        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Connection, ConfigError> {
        let connection = Connection::open(&self.path)?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;
        connection.busy_timeout(SETTINGS_BUSY_TIMEOUT)?;
        Ok(connection)
    }

    pub fn load_all(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare("SELECT key, value FROM settings ORDER BY key")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut settings = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            settings.insert(key, value);
        }
        Ok(settings)
    }

    /// Upserts `Some` values and deletes `None` keys in one transaction.
    pub fn write_changes<'a, I>(&self, changes: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (&'a str, Option<String>)>,
    {
        let mut connection = self.connection()?;
        let transaction = connection.transaction()?;
        {
            let mut upsert = transaction.prepare(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )?;
            let mut delete = transaction.prepare("DELETE FROM settings WHERE key = ?1")?;
            for (key, value) in changes {
                match value {
                    Some(value) => upsert.execute(params![key, value])?,
                    None => delete.execute(params![key])?,
                };
            }
        }
        transaction.commit()?;
        Ok(())
    }
}
