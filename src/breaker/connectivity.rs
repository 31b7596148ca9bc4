//! Host connectivity probe.
//!
//! The offline flag only colours status reporting; it never changes whether
//! a breaker calls its upstream.

use std::sync::atomic::{AtomicBool, Ordering};

pub trait Connectivity: Send + Sync {
  fn is_offline(&self) -> bool;
}

/// For hosts without a connectivity signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
  fn is_offline(&self) -> bool {
    false
  }
}

/// Connectivity flag flipped by the host application.
#[derive(Debug, Default)]
pub struct NetworkStatus {
  offline: AtomicBool,
}

impl NetworkStatus {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::Relaxed);
  }
}

impl Connectivity for NetworkStatus {
  fn is_offline(&self) -> bool {
    self.offline.load(Ordering::Relaxed)
  }
}
