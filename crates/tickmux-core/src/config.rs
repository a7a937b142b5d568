//! Startup configuration.
//!
//! Loaded once by the composition root from YAML or JSON. Durations are
//! written as integer milliseconds (`*_ms` keys); numeric fields also accept
//! numeric strings. Validation is limited to what startup needs: a non-empty
//! subject list and at least one usable feed. A single `feed:` object is
//! accepted in place of the `feeds:` list.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::FeedError;
use crate::policy::BackoffConfig;
use crate::types::TrackedSubject;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Upstream feeds. Required and non-empty.
    #[serde(default, alias = "feed", deserialize_with = "one_or_many_feeds")]
    pub feeds: Vec<FeedConfig>,
    /// Subjects to watch. Required and non-empty.
    #[serde(default)]
    pub subjects: Vec<TrackedSubject>,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Load from a `.yaml`/`.yml`/`.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FeedError::Config(format!("cannot read {}: {e}", path.display())))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, FeedError> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| FeedError::Config(format!("invalid YAML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, FeedError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| FeedError::Config(format!("invalid JSON config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup checks. Any failure here is fatal.
    pub fn validate(&self) -> Result<(), FeedError> {
        if self.subjects.is_empty() {
            return Err(FeedError::Config("subject list is missing or empty".into()));
        }
        if let Some(s) = self.subjects.iter().find(|s| s.id.trim().is_empty()) {
            return Err(FeedError::Config(format!(
                "subject with empty id (display name {:?})",
                s.display_name
            )));
        }
        if self.feeds.is_empty() {
            return Err(FeedError::Config("no feed configured".into()));
        }
        let mut names = std::collections::HashSet::new();
        let mut endpoints = std::collections::HashSet::new();
        for feed in &self.feeds {
            validate_endpoint(&feed.endpoint, &["ws", "wss"])?;
            if !names.insert(feed.name.as_str()) {
                return Err(FeedError::Config(format!("duplicate feed name {:?}", feed.name)));
            }
            // one connection per endpoint, so one header set per endpoint
            if !endpoints.insert(feed.endpoint.as_str()) {
                return Err(FeedError::Config(format!("duplicate feed endpoint {:?}", feed.endpoint)));
            }
        }
        if let Some(s) = self
            .subjects
            .iter()
            .find(|s| s.feed.as_deref().is_some_and(|f| self.feed(f).is_none()))
        {
            return Err(FeedError::Config(format!(
                "subject {} names unknown feed {:?}",
                s.id,
                s.feed.as_deref().unwrap_or_default()
            )));
        }
        for url in [&self.shadow.primary_url, &self.shadow.secondary_url, &self.shadow.auth_url]
            .into_iter()
            .flatten()
        {
            validate_endpoint(url, &["http", "https"])?;
        }
        if let Some(base) = &self.enrichment.base_url {
            validate_endpoint(base, &["http", "https"])?;
        }
        if let Some(probe) = &self.detector.probe_url {
            validate_endpoint(&probe.replace("{subject}", "x"), &["http", "https"])?;
        }
        if self.quota.ceiling_per_minute == 0 {
            return Err(FeedError::Config("quota.ceiling_per_minute must be > 0".into()));
        }
        Ok(())
    }

    pub fn feed(&self, name: &str) -> Option<&FeedConfig> {
        self.feeds.iter().find(|f| f.name == name)
    }

    /// Subjects with `enabled: true`, highest priority first.
    pub fn enabled_subjects(&self) -> Vec<TrackedSubject> {
        let mut subjects: Vec<_> = self.subjects.iter().filter(|s| s.enabled).cloned().collect();
        subjects.sort_by(|a, b| b.priority.cmp(&a.priority));
        subjects
    }
}

/// Check that `endpoint` parses as a URL with one of `schemes`.
pub fn validate_endpoint(endpoint: &str, schemes: &[&str]) -> Result<(), FeedError> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| FeedError::Config(format!("invalid endpoint {endpoint:?}: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(FeedError::Config(format!(
            "endpoint {endpoint:?} must use one of {schemes:?}"
        )));
    }
    Ok(())
}

/// Upstream feed connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Referenced by `TrackedSubject::feed`.
    #[serde(default = "default_feed_name")]
    pub name: String,
    /// WebSocket endpoint, e.g. `wss://feed.example.com/ws`.
    pub endpoint: String,
    /// Prefix for per-subject rooms; the push topic is `{prefix}{subject_id}`.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Extra handshake headers (`Origin`, `Cookie`, ...).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_feed_name() -> String {
    "default".into()
}

fn default_topic_prefix() -> String {
    "v:".into()
}

impl FeedConfig {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            topic_prefix: default_topic_prefix(),
            headers: BTreeMap::new(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Push room carrying `subject_id`'s activity.
    pub fn room(&self, subject_id: &str) -> String {
        format!("{}{}", self.topic_prefix, subject_id)
    }
}

fn one_or_many_feeds<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<FeedConfig>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(FeedConfig),
        Many(Vec<FeedConfig>),
    }
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(feed) => vec![feed],
        OneOrMany::Many(feeds) => feeds,
    })
}

/// Quota governor and enrichment cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_ceiling", deserialize_with = "coerce::u32_value")]
    pub ceiling_per_minute: u32,
    #[serde(default, deserialize_with = "coerce::opt_u32")]
    pub ceiling_per_hour: Option<u32>,
    #[serde(default, deserialize_with = "coerce::opt_u32")]
    pub ceiling_per_day: Option<u32>,
    /// Advisory cost-unit budget per day; only used for projections.
    #[serde(default, deserialize_with = "coerce::f64_value")]
    pub daily_budget_units: f64,
    /// Cost units charged per call when the caller does not say otherwise.
    #[serde(default = "default_cost", deserialize_with = "coerce::f64_value")]
    pub default_cost: f64,
    #[serde(rename = "default_ttl_ms", default = "default_enrich_ttl", with = "millis")]
    pub default_ttl: Duration,
    /// Per-call-type cache TTLs in milliseconds.
    #[serde(default)]
    pub ttl_ms: HashMap<String, u64>,
    #[serde(default = "default_cache_capacity", deserialize_with = "coerce::usize_value")]
    pub cache_capacity: usize,
}

fn default_ceiling() -> u32 { 50 }
fn default_cost() -> f64 { 1.0 }
fn default_enrich_ttl() -> Duration { Duration::from_secs(60) }
fn default_cache_capacity() -> usize { 1_000 }

impl QuotaConfig {
    /// TTL for `call_type`, falling back to `default_ttl`.
    pub fn ttl_for(&self, call_type: &str) -> Duration {
        self.ttl_ms
            .get(call_type)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(self.default_ttl)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            ceiling_per_minute: default_ceiling(),
            ceiling_per_hour: None,
            ceiling_per_day: None,
            daily_budget_units: 0.0,
            default_cost: default_cost(),
            default_ttl: default_enrich_ttl(),
            ttl_ms: HashMap::new(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Dual-channel detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(rename = "poll_interval_ms", default = "default_poll", with = "millis")]
    pub poll_interval: Duration,
    /// Activity older than this (by its own timestamp) is dropped.
    #[serde(rename = "recency_ms", default = "default_recency", with = "millis")]
    pub recency: Duration,
    #[serde(rename = "signal_ttl_ms", default = "default_signal_ttl", with = "millis")]
    pub signal_ttl: Duration,
    #[serde(default = "default_signal_capacity", deserialize_with = "coerce::usize_value")]
    pub cache_capacity: usize,
    /// Poll endpoint template; `{subject}` is replaced by the subject id.
    /// Without it only the push channel runs.
    #[serde(default)]
    pub probe_url: Option<String>,
    #[serde(default)]
    pub probe_api_key: Option<String>,
}

fn default_poll() -> Duration { Duration::from_millis(500) }
fn default_recency() -> Duration { Duration::from_secs(30) }
fn default_signal_ttl() -> Duration { Duration::from_secs(8) }
fn default_signal_capacity() -> usize { 4_096 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll(),
            recency: default_recency(),
            signal_ttl: default_signal_ttl(),
            cache_capacity: default_signal_capacity(),
            probe_url: None,
            probe_api_key: None,
        }
    }
}

/// Paced batcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size", deserialize_with = "coerce::usize_value")]
    pub max_batch_size: usize,
    #[serde(rename = "inter_item_delay_ms", default = "default_item_delay", with = "millis")]
    pub inter_item_delay: Duration,
    #[serde(rename = "idle_flush_ms", default = "default_idle_flush", with = "millis")]
    pub idle_flush: Duration,
}

fn default_batch_size() -> usize { 10 }
fn default_item_delay() -> Duration { Duration::from_millis(200) }
fn default_idle_flush() -> Duration { Duration::from_secs(1) }

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_batch_size(),
            inter_item_delay: default_item_delay(),
            idle_flush: default_idle_flush(),
        }
    }
}

/// Shadow polling loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    #[serde(rename = "cadence_ms", default = "default_cadence", with = "millis")]
    pub cadence: Duration,
    #[serde(default)]
    pub primary_url: Option<String>,
    #[serde(default)]
    pub secondary_url: Option<String>,
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(rename = "request_timeout_ms", default = "default_request_timeout", with = "millis")]
    pub request_timeout: Duration,
}

fn default_cadence() -> Duration { Duration::from_secs(5) }
fn default_request_timeout() -> Duration { Duration::from_secs(10) }

impl ShadowConfig {
    /// The loop only runs when both fetch URLs are configured.
    pub fn is_configured(&self) -> bool {
        self.primary_url.is_some() && self.secondary_url.is_some()
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            cadence: default_cadence(),
            primary_url: None,
            secondary_url: None,
            auth_url: None,
            refresh_token: None,
            request_timeout: default_request_timeout(),
        }
    }
}

/// External lookup service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    /// Sent as written; `${VAR}` references are not expanded.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(rename = "request_timeout_ms", default = "default_request_timeout", with = "millis")]
    pub request_timeout: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            request_timeout: default_request_timeout(),
        }
    }
}

/// Thresholds a candidate must meet before it is worth analysing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_min_liquidity", deserialize_with = "coerce::f64_value")]
    pub min_liquidity: f64,
    #[serde(default = "default_min_holders", deserialize_with = "coerce::u64_value")]
    pub min_holders: u64,
    /// Percentage (0-100) of supply held by the creator.
    #[serde(default = "default_max_dev", deserialize_with = "coerce::f64_value")]
    pub max_dev_concentration: f64,
}

fn default_min_liquidity() -> f64 { 25.0 }
fn default_min_holders() -> u64 { 10 }
fn default_max_dev() -> f64 { 20.0 }

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_liquidity: default_min_liquidity(),
            min_holders: default_min_holders(),
            max_dev_concentration: default_max_dev(),
        }
    }
}

/// Tracing output settings. `RUST_LOG` overrides `level` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter applied to every crate without an entry in `components`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Crate name (`tickmux-ws` or `tickmux_ws`) to its own filter level.
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// One JSON object per event instead of the compact text format.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

pub(crate) fn bool_true() -> bool {
    true
}

/// Lenient numeric coercion: accepts integers, floats and numeric strings.
pub mod coerce {
    use serde::{Deserialize, Deserializer};

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    pub enum Lenient {
        Int(u64),
        Float(f64),
        Text(String),
    }

    impl Lenient {
        pub fn as_u64(&self) -> Result<u64, String> {
            match self {
                Self::Int(n) => Ok(*n),
                Self::Float(f) if *f >= 0.0 && f.is_finite() => Ok(*f as u64),
                Self::Float(f) => Err(format!("expected a non-negative number, got {f}")),
                Self::Text(s) => s
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("expected an integer, got {s:?}")),
            }
        }

        pub fn as_f64(&self) -> Result<f64, String> {
            match self {
                Self::Int(n) => Ok(*n as f64),
                Self::Float(f) => Ok(*f),
                Self::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| format!("expected a number, got {s:?}")),
            }
        }
    }

    pub fn u64_value<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        Lenient::deserialize(d)?
            .as_u64()
            .map_err(serde::de::Error::custom)
    }

    pub fn u32_value<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let n = u64_value(d)?;
        u32::try_from(n).map_err(serde::de::Error::custom)
    }

    pub fn u32_or_default<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        Ok(opt_u32(d)?.unwrap_or_default())
    }

    pub fn opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        Option::<Lenient>::deserialize(d)?
            .map(|v| {
                v.as_u64()
                    .and_then(|n| u32::try_from(n).map_err(|e| e.to_string()))
            })
            .transpose()
            .map_err(serde::de::Error::custom)
    }

    pub fn usize_value<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
        let n = u64_value(d)?;
        usize::try_from(n).map_err(serde::de::Error::custom)
    }

    pub fn f64_value<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Lenient::deserialize(d)?
            .as_f64()
            .map_err(serde::de::Error::custom)
    }
}

/// (De)serialize a `Duration` as integer milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        super::coerce::u64_value(d).map(Duration::from_millis)
    }
}
