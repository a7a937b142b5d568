//! Downstream handling of recorded signals.

use std::sync::Arc;

use async_trait::async_trait;

use tickmux_core::{FeedError, Signal};
use tickmux_enrich::{should_analyze, BatchWorker, Candidate, Enricher, FilterConfig};

/// Call type used for per-target enrichment lookups.
pub const TARGET_CALL_TYPE: &str = "token_info";

/// Enriches each signal's target and applies the candidate filter.
pub struct SignalWorker {
    enricher: Option<Arc<Enricher>>,
    filter: FilterConfig,
}

impl SignalWorker {
    pub fn new(enricher: Option<Arc<Enricher>>, filter: FilterConfig) -> Self {
        Self { enricher, filter }
    }
}

#[async_trait]
impl BatchWorker<Signal> for SignalWorker {
    async fn process(&self, signal: Signal) {
        let Some(enricher) = &self.enricher else {
            tracing::info!(
                subject = %signal.subject_id,
                target_id = %signal.target_id,
                channel = %signal.channel,
                "signal (enrichment disabled)"
            );
            return;
        };

        match enricher.lookup(&signal.target_id, TARGET_CALL_TYPE).await {
            Ok(info) => {
                let candidate = Candidate::from_value(&info);
                if should_analyze(&candidate, &self.filter) {
                    tracing::info!(
                        subject = %signal.subject_id,
                        target_id = %signal.target_id,
                        confidence = %signal.confidence,
                        liquidity = ?candidate.liquidity,
                        holders = ?candidate.holders,
                        "candidate accepted"
                    );
                } else {
                    tracing::debug!(target_id = %signal.target_id, ?candidate, "candidate filtered out");
                }
            }
            Err(FeedError::QuotaExceeded { retry_after_ms }) => {
                tracing::warn!(target_id = %signal.target_id, retry_after_ms, "enrichment deferred by quota");
            }
            Err(e) => {
                tracing::warn!(target_id = %signal.target_id, error = %e, "enrichment failed");
            }
        }
    }
}
