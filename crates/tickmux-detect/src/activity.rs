//! Activity records and the poll-side probe.
//!
//! An activity record is complete only when it carries a witness id, a
//! target and a timestamp. Anything less is at best a hint that something
//! happened; it never becomes a signal on its own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tickmux_core::config::DetectorConfig;
use tickmux_core::{FeedError, Result, TrackedSubject};

const WITNESS_KEYS: &[&str] = &["signature", "witness_id", "tx_hash", "txHash", "hash"];
const TARGET_KEYS: &[&str] = &[
    "pair.tokenAddress",
    "tokenAddress",
    "token_address",
    "mint",
    "target_id",
    "target",
];
const TIME_KEYS: &[&str] = &["timestamp", "timestamp_ms", "blockTime", "block_time", "created_at"];
const ACTION_KEYS: &[&str] = &["type", "transaction_type", "side", "action"];
const MAGNITUDE_KEYS: &[&str] = &["total_sol", "volume_sol", "sol_amount", "amount", "magnitude"];

/// A complete activity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub witness_id: String,
    pub target_id: String,
    /// `"unknown"` when the record does not say.
    pub action: String,
    /// `0.0` when the record does not say.
    pub magnitude: f64,
    pub timestamp_ms: u64,
}

impl Activity {
    /// Parse a single activity record. Returns `None` unless witness id,
    /// target and timestamp are all present.
    pub fn from_value(value: &Value) -> Option<Self> {
        let witness_id = first_str(value, WITNESS_KEYS)?;
        let target_id = first_str(value, TARGET_KEYS)?;
        let timestamp_ms = TIME_KEYS.iter().find_map(|k| lookup(value, k).and_then(parse_timestamp))?;
        Some(Self {
            witness_id,
            target_id,
            action: first_str(value, ACTION_KEYS)
                .map(|a| a.to_ascii_lowercase())
                .unwrap_or_else(|| "unknown".into()),
            magnitude: MAGNITUDE_KEYS
                .iter()
                .find_map(|k| lookup(value, k).and_then(as_f64))
                .unwrap_or(0.0),
            timestamp_ms,
        })
    }

    /// Most recent record in a probe response: a bare record, an array
    /// (newest first), or an array under `data`/`transactions`/`items`.
    pub fn latest_from_response(value: &Value) -> Option<Self> {
        let list = match value {
            Value::Array(items) => Some(items),
            Value::Object(_) => ["data", "transactions", "items"]
                .iter()
                .find_map(|k| value.get(*k).and_then(Value::as_array)),
            _ => None,
        };
        match list {
            Some(items) => items.first().and_then(Self::from_value),
            None => Self::from_value(value),
        }
    }
}

/// Fetches a subject's latest activity on demand.
#[async_trait]
pub trait ActivityProbe: Send + Sync + 'static {
    /// `Ok(None)` means the subject has no visible activity.
    async fn latest(&self, subject: &TrackedSubject) -> Result<Option<Activity>>;
}

/// Probe backed by an HTTP endpoint returning recent activity as JSON.
pub struct HttpActivityProbe {
    url_template: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpActivityProbe {
    /// Returns `Ok(None)` when no probe URL is configured.
    pub fn from_config(config: &DetectorConfig) -> Result<Option<Self>> {
        let Some(template) = &config.probe_url else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .timeout(config.poll_interval.max(std::time::Duration::from_secs(2)))
            .build()
            .map_err(|e| FeedError::Config(format!("http client: {e}")))?;
        Ok(Some(Self {
            url_template: template.clone(),
            api_key: config.probe_api_key.clone(),
            http,
        }))
    }

    pub fn url_for(&self, subject: &TrackedSubject) -> String {
        self.url_template.replace("{subject}", &subject.id)
    }
}

#[async_trait]
impl ActivityProbe for HttpActivityProbe {
    async fn latest(&self, subject: &TrackedSubject) -> Result<Option<Activity>> {
        let mut req = self.http.get(self.url_for(subject));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::enrichment(Some(status.as_u16()), format!("probe {}", subject.id)));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| FeedError::MalformedPayload(e.to_string()))?;
        Ok(Activity::latest_from_response(&body))
    }
}

/// Resolve a dotted path such as `pair.tokenAddress`.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |v, part| v.get(part))
        .filter(|v| !v.is_null())
}

fn first_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match lookup(value, k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        _ => None,
    })
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|f: &f64| f.is_finite())
}

/// Seconds, milliseconds, numeric strings or RFC 3339.
fn parse_timestamp(value: &Value) -> Option<u64> {
    if let Value::String(s) = value {
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s.trim()) {
            return u64::try_from(dt.timestamp_millis()).ok();
        }
    }
    let n = as_f64(value)?;
    if n <= 0.0 {
        return None;
    }
    // anything below 1e11 is seconds since epoch
    Some(if n < 1e11 { (n * 1000.0) as u64 } else { n as u64 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wallet_transaction_shape() {
        let a = Activity::from_value(&json!({
            "maker_address": "W1",
            "pair": {"tokenAddress": "Mint1", "tokenTicker": "ABC"},
            "type": "BUY",
            "total_sol": "12.5",
            "signature": "sig-1",
            "timestamp": 1_700_000_000
        }))
        .unwrap();
        assert_eq!(a.witness_id, "sig-1");
        assert_eq!(a.target_id, "Mint1");
        assert_eq!(a.action, "buy");
        assert_eq!(a.magnitude, 12.5);
        assert_eq!(a.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn incomplete_records_are_rejected() {
        assert!(Activity::from_value(&json!({"signature": "s", "mint": "m"})).is_none());
        assert!(Activity::from_value(&json!({"signature": "s", "timestamp": 1})).is_none());
        assert!(Activity::from_value(&json!({"mint": "m", "timestamp": 1})).is_none());
        assert!(Activity::from_value(&json!({"signature": "", "mint": "m", "timestamp": 1})).is_none());
    }

    #[test]
    fn millisecond_and_rfc3339_timestamps() {
        let ms = Activity::from_value(&json!({"hash": "h", "mint": "m", "timestamp": 1_700_000_000_123u64})).unwrap();
        assert_eq!(ms.timestamp_ms, 1_700_000_000_123);
        let iso = Activity::from_value(&json!({"hash": "h", "mint": "m", "created_at": "2023-11-14T22:13:20Z"})).unwrap();
        assert_eq!(iso.timestamp_ms, 1_700_000_000_000);
        assert_eq!(iso.action, "unknown");
    }

    #[test]
    fn latest_from_response_shapes() {
        let rec = json!({"signature": "s1", "mint": "m", "blockTime": 10});
        let older = json!({"signature": "s0", "mint": "m", "blockTime": 5});
        for body in [
            rec.clone(),
            json!([rec.clone(), older.clone()]),
            json!({"transactions": [rec.clone(), older.clone()]}),
        ] {
            assert_eq!(Activity::latest_from_response(&body).unwrap().witness_id, "s1");
        }
        assert!(Activity::latest_from_response(&json!({"data": []})).is_none());
    }
}
