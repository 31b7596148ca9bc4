//! Single-file JSON storage, the layout used by the desktop shell.
//!
//! The whole store is one JSON object mapping entry keys to
//! `{"data": ..., "updatedAt": ...}` values. Every write rewrites the file.

use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::storage::data_dir;
use super::traits::{PersistentEntry, PersistentEntrySummary, PersistentStore};

const FILE_NAME: &str = "persistent-cache.json";

pub struct JsonFileStorage {
  path: PathBuf,
  /// Serializes read-modify-write cycles on the file
  lock: Mutex<()>,
}

impl JsonFileStorage {
  /// Storage at the default location.
  pub fn open() -> Result<Self> {
    Ok(Self::new(&data_dir()?.join(FILE_NAME)))
  }

  /// Storage backed by the file at `path`. The file is created on first write.
  pub fn new(path: &Path) -> Self {
    Self {
      path: path.to_path_buf(),
      lock: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Load the root object. A missing or corrupt file reads as empty.
  fn read_root(&self) -> Result<Map<String, Value>> {
    if !self.path.exists() {
      return Ok(Map::new());
    }

    let contents = std::fs::read_to_string(&self.path)
      .map_err(|e| eyre!("Failed to read cache store {}: {}", self.path.display(), e))?;

    Ok(
      serde_json::from_str::<Value>(&contents)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default(),
    )
  }

  fn write_root(&self, root: Map<String, Value>) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory {}: {}", parent.display(), e))?;
    }

    let serialized = serde_json::to_string_pretty(&Value::Object(root))
      .map_err(|e| eyre!("Failed to serialize cache store: {}", e))?;
    std::fs::write(&self.path, serialized)
      .map_err(|e| eyre!("Failed to write cache store {}: {}", self.path.display(), e))
  }
}

fn decode(value: &Value) -> Option<PersistentEntry> {
  serde_json::from_value(value.clone()).ok()
}

impl PersistentStore for JsonFileStorage {
  fn get_entry(&self, key: &str) -> Result<Option<PersistentEntry>> {
    let _guard = self.lock.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(self.read_root()?.get(key).and_then(decode))
  }

  fn set_entry(&self, key: &str, entry: &PersistentEntry) -> Result<()> {
    let _guard = self.lock.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut root = self.read_root()?;

    if let Some(existing) = root.get(key).and_then(decode) {
      if existing.updated_at > entry.updated_at {
        return Ok(());
      }
    }

    let value =
      serde_json::to_value(entry).map_err(|e| eyre!("Invalid cache payload JSON: {}", e))?;
    root.insert(key.to_string(), value);
    self.write_root(root)
  }

  fn delete_entry(&self, key: &str) -> Result<()> {
    let _guard = self.lock.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut root = self.read_root()?;
    if root.remove(key).is_some() {
      self.write_root(root)?;
    }
    Ok(())
  }

  fn entries(&self) -> Result<Vec<PersistentEntrySummary>> {
    let _guard = self.lock.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // serde_json's Map is ordered by key
    Ok(
      self
        .read_root()?
        .iter()
        .filter_map(|(key, value)| {
          decode(value).map(|entry| PersistentEntrySummary {
            key: key.clone(),
            updated_at: entry.updated_at,
            size_bytes: entry.data.to_string().len(),
          })
        })
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::DateTime;
  use serde_json::json;

  fn temp_path(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .map(|d| d.as_nanos())
      .unwrap_or_default();
    std::env::temp_dir()
      .join(format!("feed-breaker-{}-{}-{}", label, std::process::id(), nanos))
      .join(FILE_NAME)
  }

  #[test]
  fn test_round_trip_through_file() {
    let path = temp_path("roundtrip");
    let store = JsonFileStorage::new(&path);
    let entry = PersistentEntry::new(
      json!({"ships": 12}),
      DateTime::from_timestamp_millis(42_000).unwrap(),
    );

    store.set_entry("breaker:ais", &entry).unwrap();

    // A second handle sees what the first wrote
    let reopened = JsonFileStorage::new(&path);
    assert_eq!(reopened.get_entry("breaker:ais").unwrap(), Some(entry));

    reopened.delete_entry("breaker:ais").unwrap();
    assert_eq!(store.get_entry("breaker:ais").unwrap(), None);
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
  }

  #[test]
  fn test_corrupt_file_reads_as_empty() {
    let path = temp_path("corrupt");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{not json").unwrap();

    let store = JsonFileStorage::new(&path);
    assert_eq!(store.get_entry("breaker:x").unwrap(), None);
    assert!(store.entries().unwrap().is_empty());

    // Writing replaces the corrupt contents
    let entry = PersistentEntry::new(json!(1), DateTime::from_timestamp_millis(1).unwrap());
    store.set_entry("breaker:x", &entry).unwrap();
    assert_eq!(store.get_entry("breaker:x").unwrap(), Some(entry));
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
  }

  #[test]
  fn test_reads_desktop_shell_layout() {
    let path = temp_path("layout");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
      &path,
      r#"{"breaker:fred":{"data":[1,2,3],"updatedAt":1700000000000},"other":"junk"}"#,
    )
    .unwrap();

    let store = JsonFileStorage::new(&path);
    let entry = store.get_entry("breaker:fred").unwrap().unwrap();
    assert_eq!(entry.data, json!([1, 2, 3]));
    assert_eq!(entry.updated_at.timestamp_millis(), 1_700_000_000_000);

    // Entries that are not breaker payloads are skipped in listings
    let keys: Vec<String> = store.entries().unwrap().into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec!["breaker:fred"]);
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
  }
}
