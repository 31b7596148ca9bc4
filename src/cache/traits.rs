//! Core traits and types for the durable cache.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix applied to a breaker name to form its durable key.
pub const KEY_PREFIX: &str = "breaker:";

/// Durable key for the breaker called `name`.
pub fn persistent_key(name: &str) -> String {
  format!("{KEY_PREFIX}{name}")
}

/// A cached payload as it sits in durable storage.
///
/// Serialized as `{"data": ..., "updatedAt": <epoch millis>}` so files written
/// by the desktop shell and by this crate are interchangeable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentEntry {
  pub data: Value,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub updated_at: DateTime<Utc>,
}

impl PersistentEntry {
  pub fn new(data: Value, updated_at: DateTime<Utc>) -> Self {
    Self { data, updated_at }
  }
}

/// Listing row for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentEntrySummary {
  pub key: String,
  pub updated_at: DateTime<Utc>,
  /// Size of the serialized payload
  pub size_bytes: usize,
}

/// Trait for durable storage backends.
///
/// Calls are blocking; breakers run them off the async executor.
pub trait PersistentStore: Send + Sync {
  /// Read the entry stored under `key`.
  fn get_entry(&self, key: &str) -> Result<Option<PersistentEntry>>;

  /// Write `entry` under `key`.
  ///
  /// An existing entry with a newer `updated_at` is left in place.
  fn set_entry(&self, key: &str, entry: &PersistentEntry) -> Result<()>;

  /// Remove the entry under `key`. Missing keys are not an error.
  fn delete_entry(&self, key: &str) -> Result<()>;

  /// List all stored entries, ordered by key.
  fn entries(&self) -> Result<Vec<PersistentEntrySummary>>;
}
