//! Cache storage traits with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::traits::{CachedEntry, StoredValue};
use crate::db::Database;
use crate::net::{RequestKey, Response, ResponseKind};

/// Trait for cache generation backends.
///
/// Every call is atomic on its own; there is no cross-call transaction.
/// Concurrent writes to the same key resolve last-write-wins.
pub trait CacheStorage: Send + Sync {
  /// Create the generation if it does not exist yet.
  fn open(&self, generation: &str) -> Result<()>;

  /// Upsert one entry, creating the generation if needed.
  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Upsert a batch of entries. Either all are stored or none are.
  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Look up an entry in one generation.
  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Names of all existing generations.
  fn generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and every entry in it. Returns false if it did not exist.
  fn delete(&self, generation: &str) -> Result<bool>;
}

/// Persistent string key/value store, the page's local storage.
pub trait LocalStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<StoredValue>>;

  fn set(&self, key: &str, value: &str) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;
}

/// Storage that lives only as long as the process.
/// Used for `--ephemeral` runs and in tests.
#[derive(Default)]
pub struct MemoryStorage {
  generations: Mutex<BTreeMap<String, HashMap<RequestKey, CachedEntry>>>,
  local: Mutex<HashMap<String, StoredValue>>,
  fail_writes: AtomicBool,
  fail_deletes: AtomicBool,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every write fail, as a full quota would.
  #[cfg(test)]
  pub fn set_fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  /// Make every generation delete fail.
  #[cfg(test)]
  pub fn set_fail_deletes(&self, fail: bool) {
    self.fail_deletes.store(fail, Ordering::SeqCst);
  }

  fn check_writable(&self) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(eyre!("Storage quota exceeded"));
    }
    Ok(())
  }

  fn generations_lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, HashMap<RequestKey, CachedEntry>>>> {
    self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn local_lock(&self) -> Result<MutexGuard<'_, HashMap<String, StoredValue>>> {
    self.local.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn memory_entry(generation: &str, key: &RequestKey, response: &Response) -> CachedEntry {
  CachedEntry {
    generation: generation.to_string(),
    key: key.clone(),
    response: response.clone(),
    cached_at: Utc::now(),
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, generation: &str) -> Result<()> {
    self
      .generations_lock()?
      .entry(generation.to_string())
      .or_default();
    Ok(())
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self.check_writable()?;
    self
      .generations_lock()?
      .entry(generation.to_string())
      .or_default()
      .insert(key.clone(), memory_entry(generation, key, response));
    Ok(())
  }

  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    self.check_writable()?;
    let mut generations = self.generations_lock()?;
    let target = generations.entry(generation.to_string()).or_default();
    for (key, response) in entries {
      target.insert(key.clone(), memory_entry(generation, key, response));
    }
    Ok(())
  }

  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    Ok(
      self
        .generations_lock()?
        .get(generation)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn generations(&self) -> Result<Vec<String>> {
    Ok(self.generations_lock()?.keys().cloned().collect())
  }

  fn delete(&self, generation: &str) -> Result<bool> {
    if self.fail_deletes.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to delete generation {}", generation));
    }
    Ok(self.generations_lock()?.remove(generation).is_some())
  }
}

impl LocalStore for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<StoredValue>> {
    Ok(self.local_lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self.check_writable()?;
    self.local_lock()?.insert(
      key.to_string(),
      StoredValue {
        value: value.to_string(),
        updated_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.local_lock()?.remove(key);
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let db = Database::open(path)?;
    Ok(Self {
      conn: Mutex::new(db.into_conn()),
    })
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let db = Database::open_in_memory()?;
    Ok(Self {
      conn: Mutex::new(db.into_conn()),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const INSERT_GENERATION: &str = "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)";

const UPSERT_ENTRY: &str = "INSERT OR REPLACE INTO cache_entries
   (generation, method, url, response_url, status, kind, headers, body, cached_at)
   VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))";

fn insert_entry(
  conn: &Connection,
  generation: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      UPSERT_ENTRY,
      params![
        generation,
        key.method,
        key.url,
        response.url.as_str(),
        response.status,
        response.kind.as_str(),
        headers,
        &response.body[..],
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, generation: &str) -> Result<()> {
    self
      .conn()?
      .execute(INSERT_GENERATION, params![generation])
      .map_err(|e| eyre!("Failed to open generation {}: {}", generation, e))?;
    Ok(())
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(INSERT_GENERATION, params![generation])
      .map_err(|e| eyre!("Failed to open generation {}: {}", generation, e))?;
    insert_entry(&tx, generation, key, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(INSERT_GENERATION, params![generation])
      .map_err(|e| eyre!("Failed to open generation {}: {}", generation, e))?;
    for (key, response) in entries {
      insert_entry(&tx, generation, key, response)?;
    }

    // Dropping an uncommitted transaction rolls it back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;

    let row: Option<(String, u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT response_url, status, kind, headers, body, cached_at FROM cache_entries
         WHERE generation = ? AND method = ? AND url = ?",
        params![generation, key.method, key.url],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    let Some((response_url, status, kind, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let response = Response {
      url: Url::parse(&response_url)
        .map_err(|e| eyre!("Corrupt response url '{}': {}", response_url, e))?,
      status,
      kind: ResponseKind::parse(&kind).ok_or_else(|| eyre!("Unknown response kind '{}'", kind))?,
      headers: serde_json::from_str(&headers)
        .map_err(|e| eyre!("Failed to parse stored headers: {}", e))?,
      body: body.into(),
    };

    Ok(Some(CachedEntry {
      generation: generation.to_string(),
      key: key.clone(),
      response,
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, generation: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", generation, e))?;
    let removed = tx
      .execute(
        "DELETE FROM cache_generations WHERE name = ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }
}

impl LocalStore for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<StoredValue>> {
    let conn = self.conn()?;
    let row: Option<(String, String)> = conn
      .query_row(
        "SELECT value, updated_at FROM local_storage WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

    match row {
      Some((value, updated_at)) => Ok(Some(StoredValue {
        value,
        updated_at: parse_datetime(&updated_at)?,
      })),
      None => Ok(None),
    }
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO local_storage (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM local_storage WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove {}: {}", key, e))?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
