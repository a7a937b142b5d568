//! tickmux-detect — dual-channel (push + poll) activity detection.
//!
//! A [`Detector`] watches each tracked subject through a push room on the
//! shared feed connection and a periodic [`ActivityProbe`] poll, merges the
//! two by first arrival per witness id, and keeps recorded [`Signal`]s in a
//! self-expiring cache keyed by target.
//!
//! [`Signal`]: tickmux_core::Signal

pub mod activity;
pub mod detector;

pub use activity::{Activity, ActivityProbe, HttpActivityProbe};
pub use detector::{Detector, DetectorSettings, DetectorStats, RecordOutcome, SubjectState};
