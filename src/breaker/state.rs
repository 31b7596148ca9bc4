//! Failure counting and cooldown for a single source.
//!
//! # States
//! - Closed: fewer than `max_failures` consecutive failures, calls allowed
//! - Open: `cooldown_until` lies in the future, calls short-circuited
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count reaches max_failures
//! Open → Open: another failure re-arms the cooldown from now
//! Open → Closed: first is_on_cooldown() check after cooldown_until passes
//! any → Closed: a success
//! ```
//!
//! There is no timer; expiry is observed lazily, so callers must check
//! `is_on_cooldown` before trusting `failure_count`.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakerState {
  failure_count: u32,
  cooldown_until: Option<DateTime<Utc>>,
  last_error: Option<String>,
}

impl BreakerState {
  pub fn failure_count(&self) -> u32 {
    self.failure_count
  }

  pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
    self.cooldown_until
  }

  pub fn last_error(&self) -> Option<&str> {
    self.last_error.as_deref()
  }

  /// True while open. An expired cooldown closes the breaker here.
  pub fn is_on_cooldown(&mut self, now: DateTime<Utc>) -> bool {
    match self.cooldown_until {
      Some(until) if now < until => true,
      Some(_) => {
        self.reset();
        false
      }
      None => false,
    }
  }

  /// Count a failure. Returns true when this failure (re)armed the cooldown.
  pub fn record_failure(
    &mut self,
    error: Option<String>,
    now: DateTime<Utc>,
    max_failures: u32,
    cooldown: Duration,
  ) -> bool {
    self.failure_count = self.failure_count.saturating_add(1);
    if self.failure_count >= max_failures {
      let until = now.checked_add_signed(cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC);
      self.cooldown_until = Some(until);
      self.last_error = error;
      return true;
    }
    false
  }

  /// Close the breaker, forgetting the error that opened it.
  pub fn reset(&mut self) {
    *self = Self::default();
  }

  /// Whole seconds until the cooldown ends, rounded up.
  pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> u64 {
    let Some(until) = self.cooldown_until else {
      return 0;
    };
    let ms = (until - now).num_milliseconds().max(0);
    u64::try_from((ms + 999) / 1000).unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
  }

  fn fail(state: &mut BreakerState, now: DateTime<Utc>) -> bool {
    state.record_failure(Some("boom".into()), now, 2, Duration::seconds(5))
  }

  #[test]
  fn test_opens_after_max_failures() {
    let mut state = BreakerState::default();

    assert!(!fail(&mut state, t0()));
    assert!(!state.is_on_cooldown(t0()));
    assert_eq!(state.last_error(), None);

    assert!(fail(&mut state, t0()));
    assert!(state.is_on_cooldown(t0()));
    assert!(state.is_on_cooldown(t0() + Duration::milliseconds(4999)));
    assert_eq!(state.last_error(), Some("boom"));
    assert_eq!(state.cooldown_remaining(t0()), 5);
  }

  #[test]
  fn test_expiry_resets_failure_count() {
    let mut state = BreakerState::default();
    fail(&mut state, t0());
    fail(&mut state, t0());

    let later = t0() + Duration::seconds(5);
    assert!(!state.is_on_cooldown(later));
    assert_eq!(state.failure_count(), 0);
    assert_eq!(state.cooldown_until(), None);
    assert_eq!(state.last_error(), None);

    // A single failure after expiry does not reopen
    assert!(!fail(&mut state, later));
    assert!(!state.is_on_cooldown(later));
  }

  #[test]
  fn test_count_survives_until_expiry_is_observed() {
    let mut state = BreakerState::default();
    fail(&mut state, t0());
    fail(&mut state, t0());

    // Without an intervening check the count keeps growing and the next
    // failure opens again straight away
    let later = t0() + Duration::seconds(10);
    assert!(fail(&mut state, later));
    assert_eq!(state.failure_count(), 3);
    assert!(state.is_on_cooldown(later));
  }

  #[test]
  fn test_failure_while_open_extends_cooldown() {
    let mut state = BreakerState::default();
    fail(&mut state, t0());
    fail(&mut state, t0());

    let two_secs = t0() + Duration::seconds(2);
    assert!(fail(&mut state, two_secs));
    assert_eq!(state.cooldown_until(), Some(two_secs + Duration::seconds(5)));
    assert!(state.is_on_cooldown(t0() + Duration::seconds(6)));
  }

  #[test]
  fn test_reset_clears_last_error() {
    let mut state = BreakerState::default();
    fail(&mut state, t0());
    fail(&mut state, t0());
    assert_eq!(state.last_error(), Some("boom"));

    state.reset();
    assert!(!state.is_on_cooldown(t0()));
    assert_eq!(state, BreakerState::default());
  }

  #[test]
  fn test_cooldown_remaining_rounds_up() {
    let mut state = BreakerState::default();
    assert_eq!(state.cooldown_remaining(t0()), 0);

    fail(&mut state, t0());
    fail(&mut state, t0());
    assert_eq!(state.cooldown_remaining(t0() + Duration::milliseconds(3001)), 2);
    assert_eq!(state.cooldown_remaining(t0() + Duration::milliseconds(4999)), 1);
    assert_eq!(state.cooldown_remaining(t0() + Duration::seconds(9)), 0);
  }
}
