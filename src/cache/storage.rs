//! Record store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use super::key::CacheKey;

/// Errors raised by a [`RecordStore`].
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("failed to create cache directory {}: {source}", path.display())]
  CreateDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("cache database error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("invalid timestamp '{0}' in cache database")]
  Timestamp(String),

  #[error("cache store lock poisoned")]
  Poisoned,
}

/// Summary of one stored record.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEntry {
  /// `METHOD URL` of the request the record answers
  pub description: String,
  /// Size of the encoded record in bytes
  pub size: usize,
  pub stored_at: DateTime<Utc>,
}

/// Durable mapping from cache keys to encoded responses.
///
/// Implementations must be safe to share between concurrent round trips. A
/// `put` for an existing key replaces the previous record.
pub trait RecordStore: Send + Sync {
  /// Read the record stored under `key`.
  fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StorageError>;

  /// Store `record` under `key`, replacing any earlier record.
  fn put(&self, key: &CacheKey, record: &[u8]) -> Result<(), StorageError>;
}

/// SQLite-based record store.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// File name of the database inside the store directory.
  pub const DATABASE_FILE: &'static str = "records.db";

  /// Open (or create) the store in `dir`.
  pub fn open(dir: &Path) -> Result<Self, StorageError> {
    std::fs::create_dir_all(dir).map_err(|source| StorageError::CreateDir {
      path: dir.to_path_buf(),
      source,
    })?;

    let conn = Connection::open(dir.join(Self::DATABASE_FILE))?;
    Self::with_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  /// Default store directory: a fixed subdirectory of the system temp dir.
  pub fn default_dir() -> PathBuf {
    std::env::temp_dir().join("offline-http")
  }

  fn with_connection(conn: Connection) -> Result<Self, StorageError> {
    conn.execute_batch(SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// List every stored record, most recent first.
  pub fn entries(&self) -> Result<Vec<StoredEntry>, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;

    let mut stmt = conn.prepare(
      "SELECT description, length(record), stored_at FROM records
       ORDER BY stored_at DESC, description",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, i64>(1)?,
          row.get::<_, String>(2)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(description, size, stored_at)| -> Result<StoredEntry, StorageError> {
        Ok(StoredEntry {
          description,
          size: usize::try_from(size).unwrap_or_default(),
          stored_at: parse_datetime(&stored_at)?,
        })
      })
      .collect()
  }

  /// Number of stored records.
  pub fn len(&self) -> Result<usize, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or_default())
  }

  pub fn is_empty(&self) -> Result<bool, StorageError> {
    Ok(self.len()? == 0)
  }
}

/// Schema for the record table.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    cache_key TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    record BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl RecordStore for SqliteStorage {
  fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;

    let record = conn
      .query_row(
        "SELECT record FROM records WHERE cache_key = ?",
        params![key.as_str()],
        |row| row.get(0),
      )
      .optional()?;

    Ok(record)
  }

  fn put(&self, key: &CacheKey, record: &[u8]) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;

    conn.execute(
      "INSERT OR REPLACE INTO records (cache_key, description, record, stored_at)
       VALUES (?, ?, ?, datetime('now'))",
      params![key.as_str(), key.description(), record],
    )?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|_| StorageError::Timestamp(s.to_string()))
}
