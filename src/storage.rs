//! Key-scoped durable storage
//!
//! Stores serialize a snapshot of their state under a fixed key after every
//! mutation and deserialize it on construction. The backing store is a single
//! SQLite table, so a snapshot write is atomic.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, error, info};

/// Key used by the image store
pub const IMAGE_STORAGE_KEY: &str = "image-storage";
/// Key used by the auth session store
pub const AUTH_STORAGE_KEY: &str = "auth-storage";
/// Key used for gallery categories
pub const CATEGORY_STORAGE_KEY: &str = "image-categories";
/// Key used when the fingerprint cache is persisted
pub const HASH_CACHE_STORAGE_KEY: &str = "hash-cache";

/// Errors for storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// SQLite-backed key/value store holding JSON snapshots
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) the storage database at `path`
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        info!("Opened storage at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Volatile storage, used by tests and by runs without a data directory
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )
        .map_err(|e| {
            error!("Failed to create kv table: {}", e);
            e
        })?;
        debug!("Storage schema ready");
        Ok(())
    }

    /// Load and deserialize the snapshot stored under `key`
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Serialize `value` and store it under `key`, replacing any previous snapshot
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let json = serde_json::to_string(value)?;
        self.conn.lock().execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, json],
        )?;
        debug!(key, bytes = json.len(), "Saved snapshot");
        Ok(())
    }

    /// Drop the snapshot under `key`. Returns whether one existed
    pub fn remove(&self, key: &str) -> StorageResult<bool> {
        let changed = self.conn.lock().execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(changed > 0)
    }

    /// All keys currently stored
    pub fn keys(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
impl Storage {
    /// Make every later write fail while reads keep working
    pub(crate) fn reject_writes(&self) {
        let _ = self.conn.lock().execute_batch("PRAGMA query_only = ON");
    }
}
