// Durable key-value slot backing the session state (SQLite)

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

/// Key under which the access credential is mirrored
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Key under which the API origin's cookies are mirrored
pub const COOKIES_KEY: &str = "cookies";

/// Durable storage for small session values
pub trait SessionKv: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// SQLite-backed session slot
pub struct SqliteSessionKv {
    conn: Mutex<Connection>,
}

impl SqliteSessionKv {
    /// Open (or create) the session database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create session directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        tracing::debug!("Opened session database: {}", path.display());
        Self::init(conn)
    }

    /// Session slot that lives only as long as the process
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_kv (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create session_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SessionKv for SqliteSessionKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM session_kv WHERE key = ?",
            [key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("Failed to load '{}' from SQLite", key))
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO session_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            [key, value, Utc::now().to_rfc3339().as_str()],
        )
        .with_context(|| format!("Failed to save '{}' to SQLite", key))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM session_kv WHERE key = ?", [key])
            .with_context(|| format!("Failed to delete '{}' from SQLite", key))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let kv = SqliteSessionKv::open_in_memory().unwrap();
        assert_eq!(kv.get(ACCESS_TOKEN_KEY).unwrap(), None);

        kv.put(ACCESS_TOKEN_KEY, "T1").unwrap();
        assert_eq!(kv.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("T1"));

        // Upsert replaces the value
        kv.put(ACCESS_TOKEN_KEY, "T2").unwrap();
        assert_eq!(kv.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("T2"));

        kv.delete(ACCESS_TOKEN_KEY).unwrap();
        assert_eq!(kv.get(ACCESS_TOKEN_KEY).unwrap(), None);

        // Deleting a missing key is fine
        kv.delete(COOKIES_KEY).unwrap();
    }

    #[test]
    fn test_survives_reopen() {
        let path = std::env::temp_dir()
            .join(format!("janchwi-test-{}", uuid::Uuid::new_v4()))
            .join("session.sqlite3");

        {
            let kv = SqliteSessionKv::open(&path).unwrap();
            kv.put(ACCESS_TOKEN_KEY, "persisted").unwrap();
        }

        let kv = SqliteSessionKv::open(&path).unwrap();
        assert_eq!(
            kv.get(ACCESS_TOKEN_KEY).unwrap().as_deref(),
            Some("persisted")
        );

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
