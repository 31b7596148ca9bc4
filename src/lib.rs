//! Resilience and caching for unreliable dashboard data sources.
//!
//! Each upstream source gets one [`Breaker`], usually created through a
//! [`BreakerRegistry`] so its status shows up in diagnostics.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod logging;
pub mod registry;
pub mod upstream;

pub use breaker::{Breaker, BreakerOptions, DataMode, DataState};
pub use registry::{create_breaker, BreakerRegistry};
