//! Cheap pre-filter deciding whether a candidate deserves enrichment.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use tickmux_core::config::FilterConfig;

/// The fields the filter looks at. Any of them may be unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub liquidity: Option<f64>,
    pub holders: Option<u64>,
    /// Percentage (0-100) of supply held by the creator.
    pub dev_concentration: Option<f64>,
}

impl Candidate {
    /// Pull candidate fields out of a loosely-shaped payload.
    pub fn from_value(value: &Value) -> Self {
        Self {
            liquidity: first_f64(value, &["liquidity", "liquiditySol", "liquidity_sol", "liquidityUsd"]),
            holders: first_f64(value, &["holders", "holderCount", "holder_count", "numHolders"])
                .filter(|h| *h >= 0.0)
                .map(|h| h as u64),
            dev_concentration: first_f64(
                value,
                &["dev_holding_percentage", "devHoldingPercentage", "dev_concentration", "devHoldsPercent"],
            ),
        }
    }
}

/// Returns `true` only when every threshold is met. Missing fields fail.
pub fn should_analyze(candidate: &Candidate, filter: &FilterConfig) -> bool {
    let (Some(liquidity), Some(holders), Some(dev)) =
        (candidate.liquidity, candidate.holders, candidate.dev_concentration)
    else {
        return false;
    };
    liquidity >= filter.min_liquidity
        && holders >= filter.min_holders
        && dev <= filter.max_dev_concentration
}

fn first_f64(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match value.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}
