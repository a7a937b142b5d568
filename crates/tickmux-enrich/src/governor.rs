//! Quota governor and enrichment cache.
//!
//! Guards a paid lookup service with a hard per-minute ceiling (optionally
//! hour and day ceilings too) and a TTL cache keyed by `(key, call_type)`.
//!
//! The minute ceiling is enforced over a rolling 60 s log of call
//! timestamps. [`QuotaGovernor::should_call`] reserves a slot in that log
//! when it says yes, so no interleaving of callers can obtain more than
//! `ceiling_per_minute` approvals in any 60 s span. [`QuotaGovernor::record_call`]
//! then consumes the reservation instead of adding a second slot.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Datelike;
use serde::Serialize;
use serde_json::Value;

use tickmux_core::config::QuotaConfig;
use tickmux_core::{SharedClock, TtlCache};

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 3_600_000;
const DAY_MS: u64 = 86_400_000;

/// Counters owned by the governor.
#[derive(Debug, Default)]
struct QuotaState {
    /// Timestamps of calls and outstanding reservations in the last minute.
    minute_log: VecDeque<u64>,
    /// Reservations handed out by `should_call` not yet consumed.
    reserved: usize,
    hour_start_ms: u64,
    hour_calls: u64,
    day_start_ms: u64,
    day_calls: u64,
    cost_units: f64,
}

impl QuotaState {
    /// Lazily drop old minute slots and roll hour/day windows.
    fn roll(&mut self, now: u64) {
        let horizon = now.saturating_sub(MINUTE_MS);
        while self.minute_log.front().is_some_and(|t| *t <= horizon) {
            self.minute_log.pop_front();
        }
        // reservations that aged out of the log are forfeited
        self.reserved = self.reserved.min(self.minute_log.len());

        let hour_start = now - now % HOUR_MS;
        if hour_start != self.hour_start_ms {
            self.hour_start_ms = hour_start;
            self.hour_calls = 0;
        }
        let day_start = now - now % DAY_MS;
        if day_start != self.day_start_ms {
            self.day_start_ms = day_start;
            self.day_calls = 0;
        }
    }
}

/// Snapshot of the governor's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub calls_last_minute: usize,
    pub calls_this_hour: u64,
    pub calls_today: u64,
    pub cost_units: f64,
    pub minute_remaining: usize,
    pub cache_len: usize,
}

/// Advisory spend projection; never enforced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetReport {
    pub day_of_month: u32,
    pub projected_units: f64,
    pub consumed_units: f64,
    pub remaining_units: f64,
    pub on_track: bool,
}

/// Rate-limited gate in front of the lookup service.
pub struct QuotaGovernor {
    config: QuotaConfig,
    clock: SharedClock,
    state: Mutex<QuotaState>,
    cache: TtlCache<(String, String), Value>,
}

impl QuotaGovernor {
    pub fn new(config: QuotaConfig, clock: SharedClock) -> Self {
        let cache = TtlCache::new(clock.clone(), config.default_ttl, config.cache_capacity);
        Self {
            config,
            clock,
            state: Mutex::new(QuotaState::default()),
            cache,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Decide whether an outbound call for `(key, call_type)` may proceed.
    ///
    /// Returns `false` when fresh cached data exists or a ceiling is reached.
    /// A `true` answer reserves one minute slot.
    pub fn should_call(&self, key: &str, call_type: &str) -> bool {
        if self.cache_get(key, call_type).is_some() {
            return false;
        }
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.roll(now);

        if state.minute_log.len() >= self.config.ceiling_per_minute as usize {
            tracing::debug!(key, call_type, ceiling = self.config.ceiling_per_minute, "minute quota reached");
            return false;
        }
        let pending = state.reserved as u64;
        if let Some(max) = self.config.ceiling_per_hour {
            if state.hour_calls + pending >= u64::from(max) {
                tracing::debug!(key, call_type, ceiling = max, "hour quota reached");
                return false;
            }
        }
        if let Some(max) = self.config.ceiling_per_day {
            if state.day_calls + pending >= u64::from(max) {
                tracing::debug!(key, call_type, ceiling = max, "day quota reached");
                return false;
            }
        }

        state.minute_log.push_back(now);
        state.reserved += 1;
        true
    }

    /// Account for one outbound call costing `cost_units`.
    pub fn record_call(&self, cost_units: f64) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.roll(now);
        if state.reserved > 0 {
            state.reserved -= 1;
        } else {
            state.minute_log.push_back(now);
        }
        state.hour_calls += 1;
        state.day_calls += 1;
        state.cost_units += cost_units;
    }

    /// Milliseconds until the oldest minute slot frees up (0 if one is free).
    pub fn retry_after_ms(&self) -> u64 {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.roll(now);
        if state.minute_log.len() < self.config.ceiling_per_minute as usize {
            return 0;
        }
        state
            .minute_log
            .front()
            .map_or(0, |oldest| (oldest + MINUTE_MS).saturating_sub(now))
    }

    /// Live cached value for `(key, call_type)`.
    pub fn cache_get(&self, key: &str, call_type: &str) -> Option<Value> {
        self.cache.get(&cache_key(key, call_type))
    }

    /// Cached value even if expired, as long as it has not been evicted.
    pub fn cache_get_stale(&self, key: &str, call_type: &str) -> Option<Value> {
        self.cache.get_stale(&cache_key(key, call_type))
    }

    /// Store `value` with `call_type`'s TTL.
    pub fn cache_put(&self, key: &str, call_type: &str, value: Value) {
        let ttl = self.config.ttl_for(call_type);
        self.cache.insert_with_ttl(cache_key(key, call_type), value, ttl);
    }

    /// Drop expired cache entries.
    pub fn sweep(&self) -> usize {
        self.cache.sweep()
    }

    /// Drop every cached value, live or stale. Call counters are kept.
    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn status(&self) -> QuotaStatus {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.roll(now);
        let used = state.minute_log.len();
        QuotaStatus {
            calls_last_minute: used,
            calls_this_hour: state.hour_calls,
            calls_today: state.day_calls,
            cost_units: state.cost_units,
            minute_remaining: (self.config.ceiling_per_minute as usize).saturating_sub(used),
            cache_len: self.cache.len(),
        }
    }

    /// Linear projection `daily_budget_units * day_of_month` against what
    /// has been consumed so far.
    pub fn budget_report(&self, day_of_month: u32) -> BudgetReport {
        let consumed = self.lock().cost_units;
        let projected = self.config.daily_budget_units * f64::from(day_of_month);
        BudgetReport {
            day_of_month,
            projected_units: projected,
            consumed_units: consumed,
            remaining_units: projected - consumed,
            on_track: consumed <= projected,
        }
    }

    /// [`Self::budget_report`] for today's UTC date.
    pub fn budget_report_today(&self) -> BudgetReport {
        let day = chrono::DateTime::from_timestamp_millis(self.clock.now_ms() as i64)
            .map_or(1, |d| d.day());
        self.budget_report(day)
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for QuotaGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGovernor")
            .field("ceiling_per_minute", &self.config.ceiling_per_minute)
            .field("cache", &self.cache)
            .finish()
    }
}

fn cache_key(key: &str, call_type: &str) -> (String, String) {
    (key.to_owned(), call_type.to_owned())
}
