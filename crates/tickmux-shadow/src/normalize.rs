//! Payload normalization into [`CanonicalTick`]s.
//!
//! Upstream responses come in several shapes and field spellings. Every
//! field is resolved by coalescing: the first present, non-null value among
//! a list of known names wins. A record without any address-like field is
//! dropped; nothing is ever invented to fill it.

use std::sync::Arc;

use serde_json::{json, Value};

use tickmux_core::CanonicalTick;
use tickmux_enrich::QuotaGovernor;

/// Cache call type holding the last known symbol and venue per subject.
pub const META_CALL_TYPE: &str = "token_meta";

const ADDRESS_KEYS: &[&str] = &[
    "tokenAddress",
    "token_address",
    "pair.tokenAddress",
    "baseToken.address",
    "mint",
    "address",
    "pairAddress",
];
const SYMBOL_KEYS: &[&str] = &["tokenTicker", "pair.tokenTicker", "symbol", "ticker", "baseToken.symbol"];
const MARKET_CAP_KEYS: &[&str] = &["marketCapSol", "market_cap", "marketCap", "mcap", "fdv"];
const VOLUME_KEYS: &[&str] = &["volumeSol", "volume_sol", "volume24h", "volume_24h", "volume.h24"];
const AGE_KEYS: &[&str] = &["ageMinutes", "age_minutes"];
const CREATED_KEYS: &[&str] = &["createdAt", "created_at", "pairCreatedAt", "openTrading"];
const VENUE_KEYS: &[&str] = &["protocol", "dexId", "dex", "venue", "exchange"];
const LIST_KEYS: &[&str] = &["data", "pairs", "tokens", "items"];

// positional token arrays
const POS_ADDRESS: usize = 1;
const POS_TICKER: usize = 4;
const POS_VENUE: usize = 7;
const POS_VOLUME: usize = 17;
const POS_MARKET_CAP: usize = 18;
const POS_CREATED: usize = 25;

/// Normalize one response body. Never fails: unrecognised records are
/// skipped.
pub fn normalize(payload: &Value, now_ms: u64) -> Vec<CanonicalTick> {
    let mut ticks = Vec::new();
    collect(payload, now_ms, &mut ticks);
    ticks
}

fn collect(value: &Value, now_ms: u64, out: &mut Vec<CanonicalTick>) {
    match value {
        Value::Array(items) if is_positional(items) => out.extend(from_positional(items, now_ms)),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Array(row) => out.extend(from_positional(row, now_ms)),
                    Value::Object(_) => out.extend(from_object(item, now_ms)),
                    _ => {}
                }
            }
        }
        Value::Object(_) => {
            if let Some(tick) = from_object(value, now_ms) {
                out.push(tick);
                return;
            }
            if let Some(inner) = LIST_KEYS.iter().find_map(|k| value.get(*k).filter(|v| !v.is_null())) {
                collect(inner, now_ms, out);
            }
        }
        _ => {}
    }
}

/// A flat row whose address slot holds a string, as opposed to a list of
/// records.
fn is_positional(items: &[Value]) -> bool {
    items.get(POS_ADDRESS).is_some_and(Value::is_string) && !items.iter().any(Value::is_object)
}

fn from_object(value: &Value, now_ms: u64) -> Option<CanonicalTick> {
    let subject_id = first_str(value, ADDRESS_KEYS)?;
    let age_minutes = AGE_KEYS
        .iter()
        .find_map(|k| lookup(value, k).and_then(as_f64))
        .or_else(|| {
            CREATED_KEYS
                .iter()
                .find_map(|k| lookup(value, k).and_then(parse_time_ms))
                .map(|created| age_from(created, now_ms))
        });
    Some(CanonicalTick {
        timestamp_ms: now_ms,
        subject_id,
        symbol: first_str(value, SYMBOL_KEYS),
        market_cap: first_f64(value, MARKET_CAP_KEYS),
        volume_24h: first_f64(value, VOLUME_KEYS),
        age_minutes,
        venue: first_str(value, VENUE_KEYS),
    })
}

fn from_positional(row: &[Value], now_ms: u64) -> Option<CanonicalTick> {
    let subject_id = row.get(POS_ADDRESS).and_then(non_empty_str)?;
    Some(CanonicalTick {
        timestamp_ms: now_ms,
        subject_id,
        symbol: row.get(POS_TICKER).and_then(non_empty_str),
        market_cap: row.get(POS_MARKET_CAP).and_then(as_f64),
        volume_24h: row.get(POS_VOLUME).and_then(as_f64),
        age_minutes: row
            .get(POS_CREATED)
            .and_then(parse_time_ms)
            .map(|created| age_from(created, now_ms)),
        venue: row.get(POS_VENUE).and_then(non_empty_str),
    })
}

/// Normalizer that remembers symbol and venue per subject in the
/// enrichment cache and fills them into later records that lack them.
/// It only reads and writes the cache; it never triggers a lookup.
#[derive(Clone, Default)]
pub struct Normalizer {
    governor: Option<Arc<QuotaGovernor>>,
}

impl Normalizer {
    pub fn new(governor: Option<Arc<QuotaGovernor>>) -> Self {
        Self { governor }
    }

    pub fn normalize(&self, payload: &Value, now_ms: u64) -> Vec<CanonicalTick> {
        let mut ticks = normalize(payload, now_ms);
        if let Some(governor) = &self.governor {
            for tick in &mut ticks {
                fill_meta(governor, tick);
            }
        }
        ticks
    }
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Normalizer")
            .field("cache", &self.governor.is_some())
            .finish()
    }
}

fn fill_meta(governor: &QuotaGovernor, tick: &mut CanonicalTick) {
    if tick.symbol.is_none() || tick.venue.is_none() {
        if let Some(meta) = governor.cache_get(&tick.subject_id, META_CALL_TYPE) {
            if tick.symbol.is_none() {
                tick.symbol = meta.get("symbol").and_then(non_empty_str);
            }
            if tick.venue.is_none() {
                tick.venue = meta.get("venue").and_then(non_empty_str);
            }
        }
    }
    if tick.symbol.is_some() || tick.venue.is_some() {
        governor.cache_put(
            &tick.subject_id,
            META_CALL_TYPE,
            json!({ "symbol": tick.symbol, "venue": tick.venue }),
        );
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |v, part| v.get(part))
        .filter(|v| !v.is_null())
}

fn non_empty_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        _ => None,
    }
}

fn first_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| lookup(value, k).and_then(non_empty_str))
}

fn first_f64(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| lookup(value, k).and_then(as_f64))
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|f: &f64| f.is_finite())
}

/// Epoch seconds, epoch milliseconds or RFC 3339.
fn parse_time_ms(value: &Value) -> Option<u64> {
    if let Value::String(s) = value {
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s.trim()) {
            return u64::try_from(dt.timestamp_millis()).ok();
        }
    }
    let n = as_f64(value).filter(|n| *n > 0.0)?;
    Some(if n < 1e11 { (n * 1000.0) as u64 } else { n as u64 })
}

fn age_from(created_ms: u64, now_ms: u64) -> f64 {
    now_ms.saturating_sub(created_ms) as f64 / 60_000.0
}
