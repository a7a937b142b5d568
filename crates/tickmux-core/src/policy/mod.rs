//! Timing policies shared by the feed workers.
//!
//! ```text
//! connect failure → [BackoffPolicy] → sleep → reconnect → re-join rooms
//! ```

pub mod backoff;

pub use backoff::{BackoffConfig, BackoffPolicy};
