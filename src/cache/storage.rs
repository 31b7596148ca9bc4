//! Storage backends for durable cache entries.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::json_file::JsonFileStorage;
use super::traits::{PersistentEntry, PersistentEntrySummary, PersistentStore};
use crate::config::{StorageBackend, StorageConfig};

/// Open the backend selected in the configuration.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn PersistentStore>> {
  let store: Arc<dyn PersistentStore> = match config.backend {
    StorageBackend::Sqlite => match &config.path {
      Some(path) => Arc::new(SqliteStorage::open_at(path)?),
      None => Arc::new(SqliteStorage::open()?),
    },
    StorageBackend::Json => match &config.path {
      Some(path) => Arc::new(JsonFileStorage::new(path)),
      None => Arc::new(JsonFileStorage::open()?),
    },
    StorageBackend::Memory => Arc::new(MemoryStorage::new()),
  };
  Ok(store)
}

/// Directory holding this crate's durable files.
pub(crate) fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("feed-breaker"))
}

/// Storage that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, PersistentEntry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl PersistentStore for MemoryStorage {
  fn get_entry(&self, key: &str) -> Result<Option<PersistentEntry>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn set_entry(&self, key: &str, entry: &PersistentEntry) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    match entries.get(key) {
      Some(existing) if existing.updated_at > entry.updated_at => {}
      _ => {
        entries.insert(key.to_string(), entry.clone());
      }
    }
    Ok(())
  }

  fn delete_entry(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }

  fn entries(&self) -> Result<Vec<PersistentEntrySummary>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut summaries: Vec<PersistentEntrySummary> = entries
      .iter()
      .map(|(key, entry)| PersistentEntrySummary {
        key: key.clone(),
        updated_at: entry.updated_at,
        size_bytes: entry.data.to_string().len(),
      })
      .collect();
    summaries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(summaries)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&data_dir()?.join("cache.db"))
  }

  /// Create a new SQLite storage at `path`, creating parent directories.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Create a storage backed by a private in-memory database.
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
-- One serialized JSON payload per breaker
CREATE TABLE IF NOT EXISTS persistent_cache (
    cache_key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

impl PersistentStore for SqliteStorage {
  fn get_entry(&self, key: &str) -> Result<Option<PersistentEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, i64)> = conn
      .query_row(
        "SELECT data, updated_at FROM persistent_cache WHERE cache_key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    match row {
      Some((data, updated_at_ms)) => {
        let data = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
        Ok(Some(PersistentEntry {
          data,
          updated_at: parse_millis(updated_at_ms)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn set_entry(&self, key: &str, entry: &PersistentEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let data =
      serde_json::to_vec(&entry.data).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

    conn
      .execute(
        "INSERT INTO persistent_cache (cache_key, data, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(cache_key) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
         WHERE excluded.updated_at >= persistent_cache.updated_at",
        params![key, data, entry.updated_at.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

    Ok(())
  }

  fn delete_entry(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM persistent_cache WHERE cache_key = ?",
        params![key],
      )
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;

    Ok(())
  }

  fn entries(&self) -> Result<Vec<PersistentEntrySummary>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT cache_key, updated_at, length(data) FROM persistent_cache ORDER BY cache_key",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, i64, i64)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to list cache entries: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(key, updated_at_ms, size)| {
        Ok(PersistentEntrySummary {
          key,
          updated_at: parse_millis(updated_at_ms)?,
          size_bytes: usize::try_from(size).unwrap_or_default(),
        })
      })
      .collect()
  }
}

/// Convert stored epoch milliseconds back into a timestamp.
fn parse_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or_else(|| eyre!("Invalid cache timestamp {}", ms))
}
