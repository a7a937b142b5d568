//! Domain types shared across the pipeline.

use serde::{Deserialize, Serialize};

/// An external identity (wallet, address) under active observation.
///
/// Loaded once from configuration; never mutated during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSubject {
    pub id: String,
    #[serde(default, alias = "displayName", alias = "name")]
    pub display_name: String,
    #[serde(default = "crate::config::bool_true")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "crate::config::coerce::u32_or_default")]
    pub priority: u32,
    /// Feed to watch on. `None` watches every configured feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed: Option<String>,
}

impl TrackedSubject {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            enabled: true,
            priority: 0,
            feed: None,
        }
    }

    /// Pin the subject to the feed named `feed`.
    pub fn on_feed(mut self, feed: impl Into<String>) -> Self {
        self.feed = Some(feed.into());
        self
    }

    pub fn watches_feed(&self, feed: &str) -> bool {
        self.feed.as_deref().map_or(true, |f| f == feed)
    }

    /// Name for log lines: display name when set, otherwise the id.
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

/// Which detector channel produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Push,
    Poll,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Poll => write!(f, "poll"),
        }
    }
}

/// Confidence tier attached to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Medium,
    High,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A detected, freshness-checked activity signal.
///
/// Consumers only ever see clones or shared references; nothing downstream
/// can mutate a recorded signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// The tracked subject that acted.
    pub subject_id: String,
    /// The entity acted upon (e.g. a token mint); cache key for lookups.
    pub target_id: String,
    /// Observed action, e.g. `"buy"` or `"sell"`.
    pub action: String,
    pub magnitude: f64,
    pub channel: Channel,
    pub confidence: Confidence,
    /// When the activity happened according to its witness (ms since epoch).
    pub timestamp_ms: u64,
    /// Unique witness of the activity (e.g. a transaction signature).
    pub witness_id: String,
}

/// Normalized market snapshot produced by the shadow loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTick {
    pub timestamp_ms: u64,
    pub subject_id: String,
    pub symbol: Option<String>,
    pub market_cap: Option<f64>,
    pub volume_24h: Option<f64>,
    pub age_minutes: Option<f64>,
    pub venue: Option<String>,
}

/// Lifecycle state of one physical upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Published when a connection changes state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStateChange {
    pub endpoint: String,
    pub state: ConnectionState,
    pub reconnects: u64,
}
