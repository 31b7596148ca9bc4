//! Per-source circuit breaker with a layered cache.
//!
//! One breaker guards one upstream data source:
//! - Opens after consecutive failures and short-circuits calls for a cooldown
//! - Serves fresh memory, then stale memory while revalidating in the background
//! - Optionally mirrors its last good payload to durable storage across restarts

mod clock;
mod connectivity;
mod layer;
mod state;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connectivity::{AlwaysOnline, Connectivity, NetworkStatus};
pub use layer::Breaker;
pub use state::BreakerState;
pub use types::{
  BreakerOptions, BreakerValue, CacheEntry, CooldownInfo, DataMode, DataState,
  DEFAULT_CACHE_TTL_MS, DEFAULT_COOLDOWN_MS, DEFAULT_MAX_FAILURES, PERSISTENT_STALE_CEILING_MS,
};
