//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use crate::http::{Headers, Request, RequestKey, Response};

/// Row id of a stored request inside a partition.
pub type EntryId = i64;

/// A cached response with its storage metadata.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// A request held in a partition, with or without a response.
#[derive(Debug, Clone)]
pub struct StoredRequest {
  pub id: EntryId,
  pub request: Request,
  /// False for queued writes that were stored without a response
  pub has_response: bool,
}

/// Trait for cache storage backends.
///
/// Concurrent writers of the same identity are not coordinated: the last
/// `put` wins.
pub trait CacheStorage: Send + Sync {
  /// Create the partition if it does not exist yet.
  fn create_partition(&self, name: &str) -> Result<()>;

  /// Names of every partition in the store.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Drop a partition and all its entries. Returns false if it did not exist.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Look up the response stored for a GET identity.
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a GET response, replacing any entry with the same identity.
  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store a request without a response. Every call adds a new entry.
  fn enqueue(&self, partition: &str, request: &Request) -> Result<EntryId>;

  /// Every request held in the partition, oldest first.
  fn keys(&self, partition: &str) -> Result<Vec<StoredRequest>>;

  /// Remove one entry. Returns false if it was already gone.
  fn delete_entry(&self, partition: &str, id: EntryId) -> Result<bool>;

  /// Number of entries in the partition.
  fn len(&self, partition: &str) -> Result<usize>;
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
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Requests and their response snapshots. Queued writes have no response.
CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    partition TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    request_headers TEXT NOT NULL,
    request_body BLOB NOT NULL,
    status INTEGER,
    response_headers TEXT,
    response_body BLOB,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_entries_partition ON entries(partition);

-- One response per GET identity and partition
CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_identity
    ON entries(partition, request_hash) WHERE method = 'GET';
"#;

impl CacheStorage for SqliteStorage {
  fn create_partition(&self, name: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", name, e))?;

    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, response_headers, response_body, cached_at FROM entries
         WHERE partition = ? AND request_hash = ? AND method = 'GET' AND status IS NOT NULL",
        params![partition, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.url(), e))?;

    match row {
      Some((status, headers, body, cached_at)) => Ok(Some(CachedResponse {
        response: Response {
          status,
          headers: decode_headers(&headers)?,
          body: body.into(),
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
    if !request.is_get() {
      return Err(eyre!(
        "Only GET responses can be cached, got {} {}",
        request.method,
        request.url
      ));
    }

    let key = request.key();
    let request_headers = encode_headers(&request.headers)?;
    let response_headers = encode_headers(&response.headers)?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

    // Replace the previous snapshot for this identity
    tx.execute(
      "DELETE FROM entries WHERE partition = ? AND request_hash = ? AND method = 'GET'",
      params![partition, key.cache_hash()],
    )
    .map_err(|e| eyre!("Failed to replace entry: {}", e))?;

    tx.execute(
      "INSERT INTO entries (partition, request_hash, method, url, request_headers, request_body,
                            status, response_headers, response_body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition,
        key.cache_hash(),
        key.method(),
        key.url(),
        request_headers,
        request.body.as_ref(),
        response.status,
        response_headers,
        response.body.as_ref(),
      ],
    )
    .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn enqueue(&self, partition: &str, request: &Request) -> Result<EntryId> {
    let key = request.key();
    let headers = encode_headers(&request.headers)?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

    tx.execute(
      "INSERT INTO entries (partition, request_hash, method, url, request_headers, request_body)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        partition,
        key.cache_hash(),
        key.method(),
        key.url(),
        headers,
        request.body.as_ref(),
      ],
    )
    .map_err(|e| eyre!("Failed to queue request: {}", e))?;
    let id = tx.last_insert_rowid();

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(id)
  }

  fn keys(&self, partition: &str) -> Result<Vec<StoredRequest>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, request_headers, request_body, status IS NOT NULL
         FROM entries WHERE partition = ? ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![partition], |row| {
        Ok((
          row.get::<_, EntryId>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Vec<u8>>(4)?,
          row.get::<_, bool>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(id, method, url, headers, body, has_response)| {
        let method = Method::from_bytes(method.as_bytes())
          .map_err(|e| eyre!("Invalid stored method {}: {}", method, e))?;
        let url = Url::parse(&url).map_err(|e| eyre!("Invalid stored URL {}: {}", url, e))?;
        Ok(StoredRequest {
          id,
          request: Request {
            method,
            url,
            headers: decode_headers(&headers)?,
            body: body.into(),
          },
          has_response,
        })
      })
      .collect()
  }

  fn delete_entry(&self, partition: &str, id: EntryId) -> Result<bool> {
    let removed = self
      .lock()?
      .execute(
        "DELETE FROM entries WHERE partition = ? AND id = ?",
        params![partition, id],
      )
      .map_err(|e| eyre!("Failed to delete entry {}: {}", id, e))?;

    Ok(removed > 0)
  }

  fn len(&self, partition: &str) -> Result<usize> {
    let count: i64 = self
      .lock()?
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", partition, e))?;

    Ok(count as usize)
  }
}

fn encode_headers(headers: &Headers) -> Result<String> {
  serde_json::to_string(headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))
}

fn decode_headers(raw: &str) -> Result<Headers> {
  serde_json::from_str(raw).map_err(|e| eyre!("Failed to deserialize headers: {}", e))
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
