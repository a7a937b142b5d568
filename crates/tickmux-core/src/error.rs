//! Feed-level error types.

use thiserror::Error;

/// Errors that can occur anywhere in the ingestion pipeline.
///
/// Most variants are recovered locally at the worker boundary; only
/// [`FeedError::Config`] is fatal, and only at startup.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Network-level failure (connect refused, read error, unexpected close).
    #[error("connection error: {0}")]
    Connection(String),

    /// A publish was attempted while the connection was not open.
    #[error("not connected: {endpoint}")]
    NotConnected { endpoint: String },

    /// The quota governor refused the call; the caller should defer.
    #[error("quota exceeded (retry after {retry_after_ms}ms)")]
    QuotaExceeded { retry_after_ms: u64 },

    /// The external lookup service failed.
    #[error("enrichment failed ({}): {message}", status.map(|s| s.to_string()).unwrap_or_else(|| "no status".into()))]
    Enrichment { status: Option<u16>, message: String },

    /// An inbound payload could not be decoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Authentication handshake failed; callers degrade to anonymous mode.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded or is incomplete.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization failed.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl FeedError {
    /// Returns `true` if the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::NotConnected { .. }
                | Self::QuotaExceeded { .. }
                | Self::Enrichment { .. }
        )
    }

    /// Returns `true` if the error should abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn enrichment(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Enrichment {
            status,
            message: message.into(),
        }
    }
}

pub type Result<T, E = FeedError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(FeedError::Connection("reset".into()).is_retryable());
        assert!(FeedError::QuotaExceeded { retry_after_ms: 10 }.is_retryable());
        assert!(!FeedError::InvalidArgument("x".into()).is_retryable());
        assert!(!FeedError::MalformedPayload("x".into()).is_retryable());
    }

    #[test]
    fn only_config_is_fatal() {
        assert!(FeedError::Config("no subjects".into()).is_fatal());
        assert!(!FeedError::Handshake("401".into()).is_fatal());
    }

    #[test]
    fn enrichment_display_includes_status() {
        let e = FeedError::enrichment(Some(503), "upstream down");
        assert_eq!(e.to_string(), "enrichment failed (503): upstream down");
        let e = FeedError::enrichment(None, "timeout");
        assert_eq!(e.to_string(), "enrichment failed (no status): timeout");
    }
}
