//! Name-keyed table of breakers for status reporting.
//!
//! A registry hands out breakers that share its storage, clock and
//! connectivity probe, and keeps a type-erased handle to each so dashboards
//! can enumerate every source without knowing its payload type.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::breaker::{
  AlwaysOnline, Breaker, BreakerOptions, BreakerValue, Clock, Connectivity, CooldownInfo,
  DataState, SystemClock,
};
use crate::cache::{MemoryStorage, PersistentStore};

/// Type-erased view of a breaker.
pub trait BreakerHandle: Send + Sync {
  fn name(&self) -> &str;
  fn status(&self) -> String;
  fn is_on_cooldown(&self) -> bool;
  fn cooldown_info(&self) -> CooldownInfo;
  fn data_state(&self) -> DataState;
  fn clear_cache(&self);
}

impl<T: BreakerValue> BreakerHandle for Breaker<T> {
  fn name(&self) -> &str {
    Breaker::name(self)
  }

  fn status(&self) -> String {
    Breaker::status(self)
  }

  fn is_on_cooldown(&self) -> bool {
    Breaker::is_on_cooldown(self)
  }

  fn cooldown_info(&self) -> CooldownInfo {
    Breaker::cooldown_info(self)
  }

  fn data_state(&self) -> DataState {
    Breaker::data_state(self)
  }

  fn clear_cache(&self) {
    Breaker::clear_cache(self)
  }
}

pub struct BreakerRegistry {
  store: Arc<dyn PersistentStore>,
  clock: Arc<dyn Clock>,
  connectivity: Arc<dyn Connectivity>,
  breakers: RwLock<BTreeMap<String, Arc<dyn BreakerHandle>>>,
}

impl BreakerRegistry {
  /// Registry using wall-clock time and no connectivity signal.
  pub fn new(store: Arc<dyn PersistentStore>) -> Self {
    Self {
      store,
      clock: Arc::new(SystemClock),
      connectivity: Arc::new(AlwaysOnline),
      breakers: RwLock::new(BTreeMap::new()),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
    self.connectivity = connectivity;
    self
  }

  pub fn store(&self) -> &Arc<dyn PersistentStore> {
    &self.store
  }

  /// Build a breaker and register it under its name, replacing any breaker
  /// already registered there.
  pub fn create_breaker<T: BreakerValue>(&self, options: BreakerOptions) -> Breaker<T> {
    let breaker = Breaker::new(
      options,
      Arc::clone(&self.store),
      Arc::clone(&self.clock),
      Arc::clone(&self.connectivity),
    );
    self.register(Arc::new(breaker.clone()));
    breaker
  }

  pub fn register(&self, handle: Arc<dyn BreakerHandle>) {
    let name = handle.name().to_string();
    if self.write().insert(name.clone(), handle).is_some() {
      debug!(source = %name, "Replaced registered breaker");
    }
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn BreakerHandle>> {
    self.read().get(name).cloned()
  }

  /// Status text for every registered breaker, ordered by name.
  pub fn statuses(&self) -> BTreeMap<String, String> {
    self
      .handles()
      .into_iter()
      .map(|handle| (handle.name().to_string(), handle.status()))
      .collect()
  }

  pub fn data_states(&self) -> BTreeMap<String, DataState> {
    self
      .handles()
      .into_iter()
      .map(|handle| (handle.name().to_string(), handle.data_state()))
      .collect()
  }

  /// Unknown names are never on cooldown.
  pub fn is_on_cooldown(&self, name: &str) -> bool {
    self
      .get(name)
      .map(|handle| handle.is_on_cooldown())
      .unwrap_or(false)
  }

  pub fn cooldown_info(&self, name: &str) -> CooldownInfo {
    self
      .get(name)
      .map(|handle| handle.cooldown_info())
      .unwrap_or_default()
  }

  pub fn names(&self) -> Vec<String> {
    self.read().keys().cloned().collect()
  }

  /// Returns true if a breaker was registered under `name`.
  pub fn remove(&self, name: &str) -> bool {
    self.write().remove(name).is_some()
  }

  pub fn clear(&self) {
    self.write().clear();
  }

  pub fn len(&self) -> usize {
    self.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.read().is_empty()
  }

  // Snapshot so breaker locks are never taken under the registry lock
  fn handles(&self) -> Vec<Arc<dyn BreakerHandle>> {
    self.read().values().cloned().collect()
  }

  fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<dyn BreakerHandle>>> {
    self.breakers.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<dyn BreakerHandle>>> {
    self.breakers.write().unwrap_or_else(|e| e.into_inner())
  }
}

impl Default for BreakerRegistry {
  fn default() -> Self {
    Self::new(Arc::new(MemoryStorage::new()))
  }
}

/// Process-wide registry, backed by in-memory storage.
pub fn global() -> &'static BreakerRegistry {
  static GLOBAL: OnceLock<BreakerRegistry> = OnceLock::new();
  GLOBAL.get_or_init(BreakerRegistry::default)
}

/// Create a breaker in the process-wide registry.
pub fn create_breaker<T: BreakerValue>(options: BreakerOptions) -> Breaker<T> {
  global().create_breaker(options)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::breaker::{DataMode, ManualClock, NetworkStatus};
  use chrono::{DateTime, Duration};

  fn registry() -> (BreakerRegistry, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
      DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    ));
    let registry = BreakerRegistry::default().with_clock(clock.clone());
    (registry, clock)
  }

  #[test]
  fn test_statuses_cover_every_breaker() {
    let (registry, _) = registry();
    let quotes: Breaker<f64> = registry.create_breaker(BreakerOptions::new("quotes"));
    let _quakes: Breaker<Vec<String>> = registry.create_breaker(BreakerOptions::new("quakes"));

    quotes.record_failure(Some("503".into()));
    quotes.record_failure(Some("503".into()));

    let statuses = registry.statuses();
    assert_eq!(
      statuses.get("quotes").map(String::as_str),
      Some("temporarily unavailable (retry in 300s)")
    );
    assert_eq!(statuses.get("quakes").map(String::as_str), Some("ok"));
    assert_eq!(registry.names(), vec!["quakes", "quotes"]);
  }

  #[test]
  fn test_cooldown_queries_by_name() {
    let (registry, clock) = registry();
    let breaker: Breaker<i32> = registry.create_breaker(
      BreakerOptions::new("ais")
        .with_max_failures(1)
        .with_cooldown(Duration::seconds(30)),
    );
    breaker.record_failure(None);

    assert!(registry.is_on_cooldown("ais"));
    clock.advance(Duration::seconds(10));
    assert_eq!(
      registry.cooldown_info("ais"),
      CooldownInfo {
        on_cooldown: true,
        remaining_seconds: 20
      }
    );

    clock.advance(Duration::seconds(20));
    assert!(!registry.is_on_cooldown("ais"));
    assert_eq!(breaker.failure_count(), 0);
  }

  #[test]
  fn test_unknown_names() {
    let (registry, _) = registry();
    assert!(!registry.is_on_cooldown("nope"));
    assert_eq!(registry.cooldown_info("nope"), CooldownInfo::default());
    assert!(registry.get("nope").is_none());
  }

  #[test]
  fn test_reregistration_overwrites() {
    let (registry, _) = registry();
    let old: Breaker<i32> = registry.create_breaker(BreakerOptions::new("dup").with_max_failures(1));
    old.record_failure(None);
    assert!(registry.is_on_cooldown("dup"));

    let _new: Breaker<i32> = registry.create_breaker(BreakerOptions::new("dup"));
    assert_eq!(registry.len(), 1);
    assert!(!registry.is_on_cooldown("dup"));
  }

  #[test]
  fn test_remove_and_clear() {
    let (registry, _) = registry();
    let _a: Breaker<i32> = registry.create_breaker(BreakerOptions::new("a"));
    let _b: Breaker<i32> = registry.create_breaker(BreakerOptions::new("b"));

    assert!(registry.remove("a"));
    assert!(!registry.remove("a"));
    assert_eq!(registry.names(), vec!["b"]);

    registry.clear();
    assert!(registry.is_empty());
  }

  #[tokio::test]
  async fn test_shared_connectivity_reaches_breakers() {
    let network = Arc::new(NetworkStatus::new());
    let registry = BreakerRegistry::default().with_connectivity(network.clone());
    let breaker: Breaker<i32> = registry.create_breaker(BreakerOptions::new("net"));

    network.set_offline(true);
    let served = breaker
      .execute(|| async { Err::<i32, _>("no route") }, 0)
      .await;
    assert_eq!(served, 0);

    let states = registry.data_states();
    assert_eq!(states["net"].mode, DataMode::Unavailable);
    assert!(states["net"].offline);
    assert_eq!(
      registry.statuses()["net"],
      "offline mode (backend unreachable)"
    );
  }

  #[test]
  fn test_handle_clears_cache() {
    let (registry, _) = registry();
    let breaker: Breaker<i32> = registry.create_breaker(BreakerOptions::new("clearable"));
    breaker.record_success(1);

    registry.get("clearable").unwrap().clear_cache();
    assert_eq!(breaker.cached(), None);
  }

  #[test]
  fn test_global_registry_is_shared() {
    let breaker: Breaker<i32> = create_breaker(BreakerOptions::new("registry-global-test"));
    assert!(global().get("registry-global-test").is_some());
    assert_eq!(breaker.status(), "ok");
    assert!(global().remove("registry-global-test"));
  }
}
