//! Configuration and status types shared by breakers and the registry.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

pub const DEFAULT_MAX_FAILURES: u32 = 2;
pub const DEFAULT_COOLDOWN_MS: i64 = 5 * 60 * 1000;
pub const DEFAULT_CACHE_TTL_MS: i64 = 10 * 60 * 1000;

/// Durable entries older than this are never loaded into memory.
pub const PERSISTENT_STALE_CEILING_MS: i64 = 24 * 60 * 60 * 1000;

/// Values a breaker can cache.
///
/// Payloads must round-trip through JSON so they can be persisted.
pub trait BreakerValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> BreakerValue for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Immutable per-breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerOptions {
  /// Unique registry key, also used for the durable key
  pub name: String,
  /// Consecutive failures that open the breaker
  pub max_failures: u32,
  /// How long an open breaker short-circuits calls
  pub cooldown: Duration,
  /// Maximum age served without refetching. Zero disables TTL serving,
  /// stale-while-revalidate and persistence.
  pub cache_ttl: Duration,
  /// Mirror successful payloads to the durable store
  pub persist_cache: bool,
}

impl BreakerOptions {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      max_failures: DEFAULT_MAX_FAILURES,
      cooldown: Duration::milliseconds(DEFAULT_COOLDOWN_MS),
      cache_ttl: Duration::milliseconds(DEFAULT_CACHE_TTL_MS),
      persist_cache: false,
    }
  }

  pub fn with_max_failures(mut self, max_failures: u32) -> Self {
    self.max_failures = max_failures;
    self
  }

  pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
    self.cooldown = cooldown;
    self
  }

  pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
    self.cache_ttl = cache_ttl;
    self
  }

  pub fn with_persist_cache(mut self, persist_cache: bool) -> Self {
    self.persist_cache = persist_cache;
    self
  }

  /// Whether TTL serving and stale-while-revalidate are active.
  pub fn caching_enabled(&self) -> bool {
    self.cache_ttl > Duration::zero()
  }

  /// Persistence is forced off when the TTL is zero.
  pub fn persistence_enabled(&self) -> bool {
    self.persist_cache && self.caching_enabled()
  }
}

/// The last good payload held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub data: T,
  pub timestamp: DateTime<Utc>,
}

/// Where the value returned by the last call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
  /// Fresh from the upstream
  Live,
  /// Served from memory (fresh, stale, or hydrated from disk)
  Cached,
  /// Nothing usable; the caller's default was returned
  Unavailable,
}

impl fmt::Display for DataMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      DataMode::Live => "live",
      DataMode::Cached => "cached",
      DataMode::Unavailable => "unavailable",
    };
    f.pad(label)
  }
}

/// Snapshot of how a breaker answered its most recent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataState {
  pub mode: DataMode,
  pub timestamp: Option<DateTime<Utc>>,
  pub offline: bool,
}

impl DataState {
  pub fn live(timestamp: DateTime<Utc>) -> Self {
    Self {
      mode: DataMode::Live,
      timestamp: Some(timestamp),
      offline: false,
    }
  }

  pub fn cached(timestamp: DateTime<Utc>, offline: bool) -> Self {
    Self {
      mode: DataMode::Cached,
      timestamp: Some(timestamp),
      offline,
    }
  }

  pub fn unavailable(offline: bool) -> Self {
    Self {
      mode: DataMode::Unavailable,
      timestamp: None,
      offline,
    }
  }
}

impl Default for DataState {
  fn default() -> Self {
    Self::unavailable(false)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CooldownInfo {
  pub on_cooldown: bool,
  pub remaining_seconds: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_options() {
    let options = BreakerOptions::new("fred");
    assert_eq!(options.max_failures, 2);
    assert_eq!(options.cooldown, Duration::minutes(5));
    assert_eq!(options.cache_ttl, Duration::minutes(10));
    assert!(!options.persist_cache);
  }

  #[test]
  fn test_zero_ttl_forces_persistence_off() {
    let options = BreakerOptions::new("x")
      .with_persist_cache(true)
      .with_cache_ttl(Duration::zero());
    assert!(!options.caching_enabled());
    assert!(!options.persistence_enabled());

    let options = options.with_cache_ttl(Duration::seconds(1));
    assert!(options.persistence_enabled());
  }

  #[test]
  fn test_data_mode_serializes_lowercase() {
    let state = DataState::unavailable(true);
    let json = serde_json::to_value(state).unwrap();
    assert_eq!(json["mode"], "unavailable");
    assert_eq!(json["offline"], true);
    assert!(json["timestamp"].is_null());
  }
}
