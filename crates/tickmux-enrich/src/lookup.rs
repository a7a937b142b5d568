//! The governed enrichment path and its HTTP lookup service.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tickmux_core::config::EnrichmentConfig;
use tickmux_core::{FeedError, Result};

use crate::governor::QuotaGovernor;

/// External, quota-limited lookup service.
#[async_trait]
pub trait LookupService: Send + Sync + 'static {
    /// Fetch `call_type` data (e.g. `"holders"`, `"meta"`) for `subject`.
    async fn lookup(&self, subject: &str, call_type: &str) -> Result<Value>;
}

/// Cache first, then quota, then the service.
pub struct Enricher {
    governor: Arc<QuotaGovernor>,
    service: Arc<dyn LookupService>,
}

impl Enricher {
    pub fn new(governor: Arc<QuotaGovernor>, service: Arc<dyn LookupService>) -> Self {
        Self { governor, service }
    }

    pub fn governor(&self) -> &Arc<QuotaGovernor> {
        &self.governor
    }

    /// Governed lookup.
    ///
    /// Fresh cache hits never reach the service. A quota refusal is
    /// [`FeedError::QuotaExceeded`]. A failed call falls back to the last
    /// known value when one is still held, otherwise returns the failure.
    pub async fn lookup(&self, subject: &str, call_type: &str) -> Result<Value> {
        self.lookup_with_cost(subject, call_type, self.governor.config().default_cost)
            .await
    }

    pub async fn lookup_with_cost(&self, subject: &str, call_type: &str, cost_units: f64) -> Result<Value> {
        if let Some(hit) = self.governor.cache_get(subject, call_type) {
            tracing::trace!(subject, call_type, "enrichment cache hit");
            return Ok(hit);
        }
        if !self.governor.should_call(subject, call_type) {
            // a fresh entry may have landed between the two checks
            if let Some(hit) = self.governor.cache_get(subject, call_type) {
                return Ok(hit);
            }
            return Err(FeedError::QuotaExceeded {
                retry_after_ms: self.governor.retry_after_ms(),
            });
        }

        let result = self.service.lookup(subject, call_type).await;
        self.governor.record_call(cost_units);

        match result {
            Ok(value) => {
                self.governor.cache_put(subject, call_type, value.clone());
                Ok(value)
            }
            Err(e) => match self.governor.cache_get_stale(subject, call_type) {
                Some(stale) => {
                    tracing::warn!(subject, call_type, error = %e, "lookup failed, serving last known value");
                    Ok(stale)
                }
                None => {
                    tracing::warn!(subject, call_type, error = %e, "lookup failed");
                    Err(e)
                }
            },
        }
    }
}

/// `GET {base_url}/{call_type}/{subject}` with an optional bearer token.
pub struct HttpLookup {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpLookup {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| FeedError::Config("enrichment.base_url is not set".into()))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FeedError::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            http,
        })
    }

    pub fn url_for(&self, subject: &str, call_type: &str) -> String {
        format!("{}/{}/{}", self.base_url, call_type, subject)
    }
}

#[async_trait]
impl LookupService for HttpLookup {
    async fn lookup(&self, subject: &str, call_type: &str) -> Result<Value> {
        let url = self.url_for(subject, call_type);
        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| FeedError::enrichment(e.status().map(|s| s.as_u16()), e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map_or(60_000, |secs| secs * 1_000);
            return Err(FeedError::QuotaExceeded { retry_after_ms });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FeedError::enrichment(Some(status.as_u16()), body));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| FeedError::enrichment(Some(status.as_u16()), e.to_string()))
    }
}
