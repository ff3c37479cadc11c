//! Durable storage trait and SQLite implementation backing the permanent tier.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// A record read back from durable storage.
#[derive(Debug, Clone)]
pub struct StoredRecord {
  pub payload: Value,
  /// When the record was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for durable key/value backends.
pub trait DurableStorage: Send + Sync {
  /// Get the record stored under `key`.
  fn get(&self, key: &str) -> Result<Option<StoredRecord>>;

  /// Store `payload` under `key`, overwriting any previous record.
  fn set(&self, key: &str, payload: &Value) -> Result<()>;

  /// Replace the payload under `key` with `merge(current payload)`.
  ///
  /// No other write to this storage may land between the read and the write.
  fn update(&self, key: &str, merge: &mut dyn FnMut(Option<Value>) -> Value) -> Result<()>;

  /// Delete the record under `key`. Returns whether one existed.
  fn delete(&self, key: &str) -> Result<bool>;

  /// All stored keys, sorted.
  fn list_keys(&self) -> Result<Vec<String>>;

  /// Delete everything. Returns how many records were removed.
  fn clear(&self) -> Result<usize>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl DurableStorage for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<StoredRecord>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _payload: &Value) -> Result<()> {
    Ok(()) // Discard
  }

  fn update(&self, _key: &str, merge: &mut dyn FnMut(Option<Value>) -> Value) -> Result<()> {
    merge(None);
    Ok(())
  }

  fn delete(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn list_keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn clear(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based durable storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the storage at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::CacheIo(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::CacheIo(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// In-memory database, mostly for tests.
  pub fn in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
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
      .ok_or_else(|| Error::CacheIo("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("gatecache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| Error::CacheIo(format!("Failed to run cache migrations: {}", e)))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::CacheIo(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for the permanent tier.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS permanent_cache (
    cache_key TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl DurableStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
    let conn = self.lock()?;
    read_record(&conn, key)
  }

  fn set(&self, key: &str, payload: &Value) -> Result<()> {
    let conn = self.lock()?;
    write_record(&conn, key, payload)
  }

  fn update(&self, key: &str, merge: &mut dyn FnMut(Option<Value>) -> Value) -> Result<()> {
    // The connection lock is held across the read and the write.
    let conn = self.lock()?;
    let current = read_record(&conn, key)?.map(|record| record.payload);
    write_record(&conn, key, &merge(current))
  }

  fn delete(&self, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM permanent_cache WHERE cache_key = ?",
        params![key],
      )
      .map_err(|e| Error::CacheIo(format!("Failed to delete {}: {}", key, e)))?;
    Ok(removed > 0)
  }

  fn list_keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT cache_key FROM permanent_cache ORDER BY cache_key")
      .map_err(|e| Error::CacheIo(format!("Failed to prepare query: {}", e)))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| Error::CacheIo(format!("Failed to list keys: {}", e)))?
      .collect::<std::result::Result<Vec<String>, _>>()?;

    Ok(keys)
  }

  fn clear(&self) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM permanent_cache", [])
      .map_err(|e| Error::CacheIo(format!("Failed to clear cache: {}", e)))?;
    Ok(removed)
  }
}

fn read_record(conn: &Connection, key: &str) -> Result<Option<StoredRecord>> {
  let row: Option<(Vec<u8>, String)> = conn
    .query_row(
      "SELECT payload, cached_at FROM permanent_cache WHERE cache_key = ?",
      params![key],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(|e| Error::CacheIo(format!("Failed to read {}: {}", key, e)))?;

  match row {
    Some((data, cached_at)) => {
      let payload: Value = serde_json::from_slice(&data)
        .map_err(|e| Error::CacheIo(format!("Failed to deserialize {}: {}", key, e)))?;
      Ok(Some(StoredRecord {
        payload,
        cached_at: parse_datetime(&cached_at)?,
      }))
    }
    None => Ok(None),
  }
}

fn write_record(conn: &Connection, key: &str, payload: &Value) -> Result<()> {
  let data = serde_json::to_vec(payload)
    .map_err(|e| Error::CacheIo(format!("Failed to serialize {}: {}", key, e)))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO permanent_cache (cache_key, payload, cached_at)
       VALUES (?, ?, datetime('now'))",
      params![key, data],
    )
    .map_err(|e| Error::CacheIo(format!("Failed to store {}: {}", key, e)))?;

  Ok(())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| Error::CacheIo(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn set_get_roundtrip_and_overwrite() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage.set("identifier:a", &json!({"name": "first"})).unwrap();
    storage.set("identifier:a", &json!({"name": "second"})).unwrap();

    let record = storage.get("identifier:a").unwrap().unwrap();
    assert_eq!(record.payload, json!({"name": "second"}));
    assert_eq!(storage.list_keys().unwrap(), vec!["identifier:a".to_string()]);
  }

  #[test]
  fn missing_key_is_none() {
    let storage = SqliteStorage::in_memory().unwrap();
    assert!(storage.get("nope").unwrap().is_none());
    assert!(!storage.delete("nope").unwrap());
  }

  #[test]
  fn delete_and_clear() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage.set("a", &json!(1)).unwrap();
    storage.set("b", &json!(2)).unwrap();
    storage.set("c", &json!(3)).unwrap();

    assert!(storage.delete("a").unwrap());
    assert_eq!(storage.list_keys().unwrap(), vec!["b", "c"]);
    assert_eq!(storage.clear().unwrap(), 2);
    assert!(storage.list_keys().unwrap().is_empty());
  }

  #[test]
  fn survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.set("identifier:x", &json!({"ok": true})).unwrap();
    }
    let storage = SqliteStorage::open_at(&path).unwrap();
    let record = storage.get("identifier:x").unwrap().unwrap();
    assert_eq!(record.payload, json!({"ok": true}));
  }

  #[test]
  fn concurrent_updates_are_not_lost() {
    let storage = std::sync::Arc::new(SqliteStorage::in_memory().unwrap());
    let threads: Vec<_> = (0..8)
      .map(|i| {
        let storage = storage.clone();
        std::thread::spawn(move || {
          for j in 0..25 {
            storage
              .update("phone:x", &mut |current| {
                let mut items = current
                  .and_then(|v| v.as_array().cloned())
                  .unwrap_or_default();
                items.push(json!(i * 100 + j));
                Value::Array(items)
              })
              .unwrap();
          }
        })
      })
      .collect();
    for t in threads {
      t.join().unwrap();
    }

    let record = storage.get("phone:x").unwrap().unwrap();
    assert_eq!(record.payload.as_array().unwrap().len(), 200);
  }

  #[test]
  fn noop_storage_never_hits() {
    let storage = NoopStorage;
    storage.set("a", &json!(1)).unwrap();
    assert!(storage.get("a").unwrap().is_none());
    assert_eq!(storage.clear().unwrap(), 0);
  }
}
