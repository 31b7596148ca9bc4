//! Breaker that sits between a data source and its upstream.
//!
//! Every refresh goes through [`Breaker::execute`], which picks the cheapest
//! correct answer in this order:
//!
//! 1. Probe connectivity (status only)
//! 2. Hydrate from durable storage, once per breaker, shared by concurrent callers
//! 3. Breaker open: serve memory, else the caller's default
//! 4. Memory younger than the TTL: serve it
//! 5. Memory older than the TTL (TTL > 0): serve it and refresh in the background
//! 6. Nothing usable: await the upstream
//!
//! Upstream errors and panics become failures recorded on the breaker; they
//! never reach the caller.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::fmt::{self, Display};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::clock::Clock;
use super::connectivity::Connectivity;
use super::state::BreakerState;
use super::types::{
  BreakerOptions, BreakerValue, CacheEntry, CooldownInfo, DataMode, DataState,
  PERSISTENT_STALE_CEILING_MS,
};
use crate::cache::{persistent_key, PersistentEntry, PersistentStore};

type Hydration = Shared<BoxFuture<'static, ()>>;

/// Work for the per-breaker durable writer, applied in submission order.
enum StoreOp {
  Write(PersistentEntry),
  Delete,
  Flush(oneshot::Sender<()>),
}

/// Mutable state, guarded by one lock that is never held across an await.
struct Slot<T> {
  state: BreakerState,
  cache: Option<CacheEntry<T>>,
  data_state: DataState,
  hydrated: bool,
  hydration: Option<Hydration>,
  /// Bumped by `clear_cache` so late hydrations can tell they were orphaned
  generation: u64,
  refreshing: bool,
}

struct Inner<T> {
  options: BreakerOptions,
  key: String,
  store: Arc<dyn PersistentStore>,
  clock: Arc<dyn Clock>,
  connectivity: Arc<dyn Connectivity>,
  slot: Mutex<Slot<T>>,
  writer: Mutex<Option<mpsc::UnboundedSender<StoreOp>>>,
}

/// Failure gate plus layered cache for one upstream source.
///
/// Cheap to clone; clones share state. `execute` must be polled inside a
/// tokio runtime.
pub struct Breaker<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for Breaker<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> fmt::Debug for Breaker<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let slot = self.inner.lock();
    f.debug_struct("Breaker")
      .field("name", &self.inner.options.name)
      .field("state", &slot.state)
      .field("data_state", &slot.data_state)
      .field("cached", &slot.cache.is_some())
      .finish_non_exhaustive()
  }
}

impl<T: BreakerValue> Breaker<T> {
  pub fn new(
    options: BreakerOptions,
    store: Arc<dyn PersistentStore>,
    clock: Arc<dyn Clock>,
    connectivity: Arc<dyn Connectivity>,
  ) -> Self {
    let key = persistent_key(&options.name);
    Self {
      inner: Arc::new(Inner {
        options,
        key,
        store,
        clock,
        connectivity,
        slot: Mutex::new(Slot {
          state: BreakerState::default(),
          cache: None,
          data_state: DataState::default(),
          hydrated: false,
          hydration: None,
          generation: 0,
          refreshing: false,
        }),
        writer: Mutex::new(None),
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.inner.options.name
  }

  pub fn options(&self) -> &BreakerOptions {
    &self.inner.options
  }

  /// Fetch through the breaker. Always resolves, either to upstream data,
  /// cached data, or `default`.
  ///
  /// A stale hit starts at most one background refresh per breaker; further
  /// stale hits while it runs serve the stale entry without calling `fetch`.
  pub async fn execute<F, Fut, E>(&self, fetch: F, default: T) -> T
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    E: Display + Send + 'static,
  {
    let inner = &self.inner;
    let offline = inner.connectivity.is_offline();

    inner.hydrate().await;

    let now = inner.clock.now();
    let stale = {
      let mut guard = inner.lock();
      let slot = &mut *guard;

      if slot.state.is_on_cooldown(now) {
        return match &slot.cache {
          Some(entry) => {
            slot.data_state = DataState::cached(entry.timestamp, offline);
            entry.data.clone()
          }
          None => {
            slot.data_state = DataState::unavailable(offline);
            default
          }
        };
      }

      match &slot.cache {
        Some(entry) if inner.is_fresh(entry, now) => {
          slot.data_state = DataState::cached(entry.timestamp, offline);
          return entry.data.clone();
        }
        Some(entry) if inner.options.caching_enabled() => {
          slot.data_state = DataState::cached(entry.timestamp, offline);
          let launch = !slot.refreshing;
          slot.refreshing = true;
          Some((entry.data.clone(), launch))
        }
        _ => None,
      }
    };

    if let Some((data, launch)) = stale {
      if launch {
        debug!(source = %inner.options.name, "Serving stale cache, refreshing in background");
        self.spawn_refresh(upstream_call(fetch));
      }
      return data;
    }

    match upstream_call(fetch).await {
      Ok(data) => {
        self.record_success(data.clone());
        data
      }
      Err(message) => {
        warn!(source = %inner.options.name, "Fetch failed: {}", message);
        self.record_failure(Some(message));
        inner.lock().data_state = DataState::unavailable(offline);
        default
      }
    }
  }

  fn spawn_refresh(&self, call: BoxFuture<'static, std::result::Result<T, String>>) {
    // Owned by the task, so the flag clears even if the task never runs
    let refreshing = RefreshGuard(Arc::clone(&self.inner));
    let Ok(handle) = Handle::try_current() else {
      debug!(source = %self.inner.options.name, "No runtime for background refresh");
      return;
    };
    let breaker = self.clone();
    handle.spawn(async move {
      let _refreshing = refreshing;
      match call.await {
        Ok(data) => breaker.record_success(data),
        Err(message) => {
          warn!(source = %breaker.inner.options.name, "Background refresh failed: {}", message);
          breaker.record_failure(Some(message));
        }
      }
    });
  }

  /// Store a good payload and close the breaker.
  ///
  /// Exposed for callers that fetch outside `execute`, e.g. batch fan-out.
  pub fn record_success(&self, data: T) {
    let inner = &self.inner;
    let now = inner.clock.now();
    let payload = inner
      .options
      .persistence_enabled()
      .then(|| serde_json::to_value(&data));

    {
      let mut slot = inner.lock();
      slot.state.reset();
      slot.cache = Some(CacheEntry {
        data,
        timestamp: now,
      });
      slot.data_state = DataState::live(now);
    }

    match payload {
      Some(Ok(value)) => inner.submit(StoreOp::Write(PersistentEntry::new(value, now))),
      Some(Err(e)) => {
        warn!(source = %inner.options.name, "Failed to serialize payload for persistence: {}", e)
      }
      None => {}
    }
  }

  /// Count a failure, opening the breaker once `max_failures` is reached.
  pub fn record_failure(&self, error: Option<String>) {
    let inner = &self.inner;
    let now = inner.clock.now();
    let mut slot = inner.lock();
    let opened = slot.state.record_failure(
      error,
      now,
      inner.options.max_failures,
      inner.options.cooldown,
    );

    if opened {
      let failures = slot.state.failure_count();
      drop(slot);
      warn!(
        source = %inner.options.name,
        failures,
        "On cooldown for {}s after {} failures",
        inner.options.cooldown.num_seconds(),
        failures
      );
    }
  }

  /// Drop memory and durable entries. An in-flight hydration is orphaned and
  /// will not restore what was cleared.
  pub fn clear_cache(&self) {
    let inner = &self.inner;
    {
      let mut slot = inner.lock();
      slot.cache = None;
      slot.hydration = None;
      slot.generation = slot.generation.wrapping_add(1);
      slot.hydrated = true;
    }

    if inner.options.persistence_enabled() {
      inner.submit(StoreOp::Delete);
    }
  }

  /// Wait until durable writes and deletes queued so far have been applied.
  pub async fn flush(&self) {
    if !self.inner.options.persistence_enabled() {
      return;
    }
    let (done, applied) = oneshot::channel();
    self.inner.submit(StoreOp::Flush(done));
    let _ = applied.await;
  }

  /// Cached data, only while younger than the TTL.
  pub fn cached(&self) -> Option<T> {
    let now = self.inner.clock.now();
    let slot = self.inner.lock();
    slot
      .cache
      .as_ref()
      .filter(|entry| self.inner.is_fresh(entry, now))
      .map(|entry| entry.data.clone())
  }

  /// Cached data regardless of age.
  pub fn cached_or_default(&self, default: T) -> T {
    let slot = self.inner.lock();
    slot
      .cache
      .as_ref()
      .map(|entry| entry.data.clone())
      .unwrap_or(default)
  }

  pub fn is_on_cooldown(&self) -> bool {
    let now = self.inner.clock.now();
    self.inner.lock().state.is_on_cooldown(now)
  }

  pub fn cooldown_remaining(&self) -> u64 {
    let now = self.inner.clock.now();
    self.inner.lock().state.cooldown_remaining(now)
  }

  pub fn cooldown_info(&self) -> CooldownInfo {
    let now = self.inner.clock.now();
    let mut slot = self.inner.lock();
    CooldownInfo {
      on_cooldown: slot.state.is_on_cooldown(now),
      remaining_seconds: slot.state.cooldown_remaining(now),
    }
  }

  pub fn data_state(&self) -> DataState {
    self.inner.lock().data_state
  }

  /// Human-readable status for dashboards.
  pub fn status(&self) -> String {
    let now = self.inner.clock.now();
    let mut slot = self.inner.lock();

    if slot.data_state.offline {
      return match slot.data_state.mode {
        DataMode::Cached => "offline mode (serving cached data)".to_string(),
        _ => "offline mode (backend unreachable)".to_string(),
      };
    }

    if slot.state.is_on_cooldown(now) {
      return format!(
        "temporarily unavailable (retry in {}s)",
        slot.state.cooldown_remaining(now)
      );
    }

    "ok".to_string()
  }

  pub fn last_error(&self) -> Option<String> {
    self.inner.lock().state.last_error().map(String::from)
  }

  /// Raw consecutive failure count. Call `is_on_cooldown` first to observe
  /// an expired cooldown.
  pub fn failure_count(&self) -> u32 {
    self.inner.lock().state.failure_count()
  }
}

impl<T> Inner<T> {
  fn lock(&self) -> MutexGuard<'_, Slot<T>> {
    self.slot.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn is_fresh(&self, entry: &CacheEntry<T>, now: chrono::DateTime<chrono::Utc>) -> bool {
    self.options.caching_enabled() && now - entry.timestamp < self.options.cache_ttl
  }

  /// Queue a durable operation. The writer task is started on first use; with
  /// no runtime available the operation runs inline.
  fn submit(&self, op: StoreOp) {
    let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());

    let op = match writer.as_ref() {
      Some(tx) => match tx.send(op) {
        Ok(()) => return,
        Err(mpsc::error::SendError(op)) => op,
      },
      None => op,
    };

    match Handle::try_current() {
      Ok(handle) => {
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail
        let _ = tx.send(op);
        handle.spawn(drain_store_ops(
          Arc::clone(&self.store),
          self.key.clone(),
          self.options.name.clone(),
          rx,
        ));
        *writer = Some(tx);
      }
      Err(_) => {
        drop(writer);
        apply_store_op(self.store.as_ref(), &self.key, &self.options.name, op);
      }
    }
  }
}

impl<T: BreakerValue> Inner<T> {
  /// Load the durable entry once. Concurrent callers share one read.
  async fn hydrate(self: &Arc<Self>) {
    if !self.options.persistence_enabled() {
      return;
    }

    let pending = {
      let mut slot = self.lock();
      if slot.hydrated {
        return;
      }
      match slot.hydration.clone() {
        Some(pending) => pending,
        None => {
          let pending = Self::load_persistent(Arc::downgrade(self), slot.generation)
            .boxed()
            .shared();
          slot.hydration = Some(pending.clone());
          pending
        }
      }
    };

    pending.await;
  }

  async fn load_persistent(inner: Weak<Self>, generation: u64) {
    let Some(this) = inner.upgrade() else {
      return;
    };
    let store = Arc::clone(&this.store);
    let key = this.key.clone();
    drop(this);

    let loaded = tokio::task::spawn_blocking(move || store.get_entry(&key))
      .await
      .map_err(|e| eyre!("Storage task failed: {}", e))
      .and_then(|result| result);

    if let Some(this) = inner.upgrade() {
      this.apply_hydration(generation, loaded);
    }
  }

  fn apply_hydration(&self, generation: u64, loaded: Result<Option<PersistentEntry>>) {
    let name = &self.options.name;
    let now = self.clock.now();
    let mut guard = self.lock();
    let slot = &mut *guard;

    if slot.generation != generation {
      debug!(source = %name, "Discarding hydration orphaned by cache clear");
      return;
    }
    slot.hydrated = true;
    slot.hydration = None;

    let entry = match loaded {
      Ok(Some(entry)) => entry,
      Ok(None) => return,
      Err(e) => {
        warn!(source = %name, "Failed to load persistent cache: {:#}", e);
        return;
      }
    };

    if now - entry.updated_at > Duration::milliseconds(PERSISTENT_STALE_CEILING_MS) {
      debug!(source = %name, updated_at = %entry.updated_at, "Ignoring persistent cache past staleness ceiling");
      return;
    }

    // Never overwrite data that arrived while the read was in flight
    if slot.cache.is_some() {
      return;
    }

    match serde_json::from_value::<T>(entry.data) {
      Ok(data) => {
        slot.cache = Some(CacheEntry {
          data,
          timestamp: entry.updated_at,
        });
        slot.data_state = DataState::cached(entry.updated_at, false);
        debug!(source = %name, updated_at = %entry.updated_at, "Hydrated from persistent cache");
      }
      Err(e) => warn!(source = %name, "Persistent cache payload has the wrong shape: {}", e),
    }
  }
}

/// Clears the refresh flag when a background refresh ends, even if the task
/// is dropped.
struct RefreshGuard<T>(Arc<Inner<T>>);

impl<T> Drop for RefreshGuard<T> {
  fn drop(&mut self) {
    self.0.lock().refreshing = false;
  }
}

async fn drain_store_ops(
  store: Arc<dyn PersistentStore>,
  key: String,
  name: String,
  mut rx: mpsc::UnboundedReceiver<StoreOp>,
) {
  while let Some(op) = rx.recv().await {
    if let StoreOp::Flush(done) = op {
      let _ = done.send(());
      continue;
    }

    let store = Arc::clone(&store);
    let key = key.clone();
    let task_name = name.clone();
    let result =
      tokio::task::spawn_blocking(move || apply_store_op(store.as_ref(), &key, &task_name, op))
        .await;
    if let Err(e) = result {
      warn!(source = %name, "Persistent cache task failed: {}", e);
    }
  }
}

fn apply_store_op(store: &dyn PersistentStore, key: &str, name: &str, op: StoreOp) {
  match op {
    StoreOp::Write(entry) => {
      if let Err(e) = store.set_entry(key, &entry) {
        warn!(source = %name, "Failed to write persistent cache: {:#}", e);
      }
    }
    StoreOp::Delete => {
      if let Err(e) = store.delete_entry(key) {
        warn!(source = %name, "Failed to delete persistent cache: {:#}", e);
      }
    }
    StoreOp::Flush(done) => {
      let _ = done.send(());
    }
  }
}

/// Start the upstream call, turning errors and panics into a message.
fn upstream_call<T, F, Fut, E>(fetch: F) -> BoxFuture<'static, std::result::Result<T, String>>
where
  T: Send + 'static,
  F: FnOnce() -> Fut,
  Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
  E: Display + Send + 'static,
{
  match panic::catch_unwind(AssertUnwindSafe(fetch)) {
    Ok(call) => AssertUnwindSafe(call)
      .catch_unwind()
      .map(|outcome| match outcome {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
      })
      .boxed(),
    Err(payload) => future::ready(Err(panic_message(payload.as_ref()))).boxed(),
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    format!("upstream panicked: {}", message)
  } else if let Some(message) = payload.downcast_ref::<String>() {
    format!("upstream panicked: {}", message)
  } else {
    "upstream panicked".to_string()
  }
}
