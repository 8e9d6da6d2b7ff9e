use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const KEY_PREFIX: &str = "selected-pdf-ids-";
const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("local storage error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to encode selection: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("local storage lock poisoned")]
    Poisoned,
}

/// Storage key for a chat's selection, or the global scope without one.
pub fn selection_key(chat_id: Option<&str>) -> String {
    format!("{}{}", KEY_PREFIX, chat_id.unwrap_or(GLOBAL_SCOPE))
}

/// Client-side persisted key/value store holding selections as JSON arrays.
pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS local_storage (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Stored ids for `key`. Missing or unreadable entries read as empty.
    pub fn load_ids(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM local_storage WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(Vec::new());
        };

        match serde_json::from_str(&raw) {
            Ok(ids) => Ok(ids),
            Err(e) => {
                log::warn!("Discarding unreadable selection under {}: {}", key, e);
                Ok(Vec::new())
            }
        }
    }

    pub fn save_ids(&self, key: &str, ids: &[String]) -> Result<(), StorageError> {
        let value = serde_json::to_string(ids)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO local_storage (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Raw stored value, as written.
    #[cfg(test)]
    fn raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM local_storage WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}
