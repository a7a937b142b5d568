//! Exponential reconnect backoff with a cap and symmetric jitter.
//!
//! Unlike a bounded retry policy, reconnect backoff never gives up: every
//! attempt number maps to a delay, growing from `initial` and saturating at
//! `max`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::millis;

/// Configuration for the backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    #[serde(rename = "initial_ms", alias = "initial", default = "default_initial", with = "millis")]
    pub initial: Duration,
    /// Upper bound for the un-jittered delay.
    #[serde(rename = "max_ms", alias = "max", default = "default_max", with = "millis")]
    pub max: Duration,
    /// Multiplier applied per failed attempt.
    #[serde(default = "default_multiplier", deserialize_with = "crate::config::coerce::f64_value")]
    pub multiplier: f64,
    /// Jitter spread as a fraction of the delay: the result lies in
    /// `delay * (1 ± jitter_fraction)`.
    #[serde(default = "default_jitter", deserialize_with = "crate::config::coerce::f64_value")]
    pub jitter_fraction: f64,
}

fn default_initial() -> Duration { Duration::from_secs(1) }
fn default_max() -> Duration { Duration::from_secs(30) }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter() -> f64 { 0.2 }

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: default_initial(),
            max: default_max(),
            multiplier: default_multiplier(),
            jitter_fraction: default_jitter(),
        }
    }
}

/// Stateless policy: computes the delay for a given attempt number.
#[derive(Debug, Clone, Default)]
pub struct BackoffPolicy {
    pub config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th reconnect (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let base_ms = self.config.initial.as_millis() as f64 * self.config.multiplier.powi(exp);
        let cap_ms = self.config.max.as_millis() as f64;
        Duration::from_millis(base_ms.min(cap_ms).max(0.0) as u64)
    }

    /// Deterministic delay for a jitter sample in `[-1.0, 1.0]`.
    ///
    /// `-1.0` gives the shortest delay in the jitter band, `1.0` the longest.
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let spread = base * self.config.jitter_fraction.clamp(0.0, 1.0);
        let total = base + spread * jitter_sample.clamp(-1.0, 1.0);
        Duration::from_millis(total.max(0.0).round() as u64)
    }

    /// Delay for the `attempt`-th reconnect with random jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let sample = if self.config.jitter_fraction > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_for(attempt, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy::new(BackoffConfig {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: jitter,
        })
    }

    #[test]
    fn doubles_from_initial() {
        let p = policy(0.0);
        assert_eq!(p.base_delay(1), Duration::from_secs(1));
        assert_eq!(p.base_delay(2), Duration::from_secs(2));
        assert_eq!(p.base_delay(3), Duration::from_secs(4));
        assert_eq!(p.base_delay(5), Duration::from_secs(16));
    }

    #[test]
    fn capped_at_max_and_never_gives_up() {
        let p = policy(0.0);
        assert_eq!(p.base_delay(6), Duration::from_secs(30));
        assert_eq!(p.base_delay(1_000), Duration::from_secs(30));
    }

    #[test]
    fn jitter_band_is_symmetric() {
        let p = policy(0.2);
        assert_eq!(p.delay_for(2, -1.0), Duration::from_millis(1_600));
        assert_eq!(p.delay_for(2, 0.0), Duration::from_millis(2_000));
        assert_eq!(p.delay_for(2, 1.0), Duration::from_millis(2_400));
    }

    #[test]
    fn random_jitter_stays_in_band() {
        let p = policy(0.2);
        for _ in 0..100 {
            let d = p.next_delay(3).as_millis();
            assert!((3_200..=4_800).contains(&d), "d={d}");
        }
    }
}
