//! tickmux-core — shared foundation for the Tickmux feed pipeline.
//!
//! # Overview
//!
//! Tickmux ingests real-time activity feeds, fans them out to many internal
//! consumers over shared connections, enriches selected events under a strict
//! call quota, and emits short-lived, freshness-checked signals. This crate
//! holds what every other crate needs:
//!
//! - [`FeedError`] — structured error type
//! - [`TtlCache`] — bounded cache with lazy expiry
//! - [`Clock`] — injectable wall clock ([`ManualClock`] for tests)
//! - [`policy`] module — reconnect backoff
//! - [`EventBus`] — typed, panic-isolated fan-out to consumers
//! - [`config`] module — startup configuration

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod policy;
pub mod types;

pub use cache::{CacheEntry, TtlCache};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::AppConfig;
pub use error::{FeedError, Result};
pub use event::{Event, EventBus};
pub use policy::{BackoffConfig, BackoffPolicy};
pub use types::{
    CanonicalTick, Channel, Confidence, ConnectionState, ConnectionStateChange, Signal,
    TrackedSubject,
};
