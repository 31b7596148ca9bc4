//! Durable storage for breaker cache entries.
//!
//! This module provides the persistence collaborator that breakers mirror
//! their last good payload into:
//! - One entry per breaker, keyed by `breaker:<name>`
//! - Newer-wins writes so out-of-order background writes never regress data
//! - SQLite, single JSON file, and in-memory backends

mod json_file;
mod storage;
mod traits;

pub use json_file::JsonFileStorage;
pub use storage::{open_store, MemoryStorage, SqliteStorage};
pub use traits::{
  persistent_key, PersistentEntry, PersistentEntrySummary, PersistentStore, KEY_PREFIX,
};
