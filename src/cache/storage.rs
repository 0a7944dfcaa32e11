//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::partition::RequestKey;
use crate::http::Response;

/// A response read back from a partition.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored snapshot
  pub response: Response,
  /// Partition the entry was found in
  pub partition: String,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A partition is created implicitly by the first write into it, or
/// explicitly with `open_partition`. Writes overwrite any previous entry
/// for the same key in the same partition.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if it does not exist yet.
  fn open_partition(&self, name: &str) -> Result<()>;

  /// Names of all partitions, oldest first.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Drop a partition and all of its entries. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Store a single response.
  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store many responses atomically: either all entries land or none do.
  fn put_all(&self, partition: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Look up a key in one partition.
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Look up a key across all partitions, oldest partition first.
  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Number of entries stored in a partition.
  fn entry_count(&self, partition: &str) -> Result<usize>;
}

impl<S: CacheStorage> CacheStorage for Arc<S> {
  fn open_partition(&self, name: &str) -> Result<()> {
    (**self).open_partition(name)
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    (**self).partition_names()
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    (**self).delete_partition(name)
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    (**self).put(partition, key, response)
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    (**self).put_all(partition, entries)
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    (**self).get(partition, key)
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    (**self).match_any(key)
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    (**self).entry_count(partition)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("larder").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named partitions; rowid order is creation order
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request digest
CREATE TABLE IF NOT EXISTS responses (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, request_key)
);

CREATE INDEX IF NOT EXISTS idx_responses_key ON responses(request_key);
"#;

fn insert_response(
  conn: &Connection,
  partition: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO responses (partition, request_key, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition,
        key.digest(),
        key.url(),
        response.status,
        headers,
        response.body.as_ref()
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key, partition, e))?;

  Ok(())
}

type ResponseRow = (String, u16, String, Vec<u8>, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResponseRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_cached((partition, status, headers, body, cached_at): ResponseRow) -> Result<CachedResponse> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

  Ok(CachedResponse {
    response: Response {
      status,
      headers,
      body: body.into(),
    },
    partition,
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn open_partition(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", name, e))?;

    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM responses WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    insert_response(&conn, partition, key, response)
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in entries {
      insert_response(&tx, partition, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row = conn
      .query_row(
        "SELECT partition, status, headers, body, cached_at FROM responses
         WHERE partition = ? AND request_key = ?",
        params![partition, key.digest()],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", key, partition, e))?;

    row.map(into_cached).transpose()
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row = conn
      .query_row(
        "SELECT r.partition, r.status, r.headers, r.body, r.cached_at FROM responses r
         INNER JOIN partitions p ON p.name = r.partition
         WHERE r.request_key = ?
         ORDER BY p.rowid
         LIMIT 1",
        params![key.digest()],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    row.map(into_cached).transpose()
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM responses WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", partition, e))?;

    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
