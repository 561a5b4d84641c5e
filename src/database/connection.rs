//! SQLite connection management for the durable key/value store.
//!
//! Provides the [`Database`] struct that wraps a `rusqlite::Connection`,
//! runs schema migrations on open and exposes the small set of key/value
//! statements the [`SqliteStore`](super::store::SqliteStore) needs.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use super::migrations;

/// SQLite-backed key/value table.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (or creates) a SQLite database at the given file path and runs migrations.
    ///
    /// # Errors
    /// Returns `rusqlite::Error` if the connection cannot be established or migrations fail.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        migrations::run_all(&conn)?;
        Ok(Self { conn })
    }

    /// Opens an in-memory SQLite database and runs migrations.
    ///
    /// # Errors
    /// Returns `rusqlite::Error` if the connection cannot be established or migrations fail.
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        migrations::run_all(&conn)?;
        Ok(Self { conn })
    }

    /// Returns a reference to the underlying `rusqlite::Connection`.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Reads the raw JSON text stored under `key`.
    pub fn get_value(&self, key: &str) -> Result<Option<String>, rusqlite::Error> {
        self.conn
            .query_row("SELECT value FROM kv_store WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
    }

    /// Upserts `value` under `key` and bumps the key's revision.
    pub fn put_value(&self, key: &str, value: &str, updated_at: i64) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO kv_store (key, value, updated_at, revision) VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at,
                                            revision = kv_store.revision + 1",
            params![key, value, updated_at],
        )?;
        Ok(())
    }

    /// Deletes `key`. Returns true if a row was removed.
    pub fn delete_value(&self, key: &str) -> Result<bool, rusqlite::Error> {
        let n = self.conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    /// Number of writes recorded for `key` (0 if the key was never written).
    pub fn revision(&self, key: &str) -> Result<i64, rusqlite::Error> {
        Ok(self
            .conn
            .query_row("SELECT revision FROM kv_store WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?
            .unwrap_or(0))
    }
}
