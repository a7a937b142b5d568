//! tickmux-shadow — read-only shadow polling.
//!
//! - [`ShadowLoop`] — fixed-cadence loop over a [`ShadowSource`]
//! - [`normalize`] / [`Normalizer`] — heterogeneous payloads → [`CanonicalTick`]
//!
//! [`CanonicalTick`]: tickmux_core::CanonicalTick

pub mod normalize;
pub mod runner;
pub mod source;

pub use normalize::{normalize, Normalizer, META_CALL_TYPE};
pub use runner::{ShadowLoop, ShadowStats};
pub use source::{FeedKind, HttpShadowSource, ShadowSource};
