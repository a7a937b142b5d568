//! Dual-channel activity detector.
//!
//! Every enabled subject is watched on two channels at once: a push room on
//! each feed it watches (one shared connection per feed endpoint) and a
//! fixed-interval poll of an [`ActivityProbe`]. Whichever channel reports a witness first wins; the
//! other is dropped as a duplicate. Recorded signals live in a TTL cache
//! keyed by target and are evicted when their TTL runs out.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use tickmux_core::config::{DetectorConfig, FeedConfig};
use tickmux_core::{
    Channel, Confidence, Event, EventBus, FeedError, Result, SharedClock, Signal, TrackedSubject, TtlCache,
};
use tickmux_ws::{Frame, Multiplexer, SubscriptionHandle};

use crate::activity::{Activity, ActivityProbe};

/// What [`Detector::record_signal`] did with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Recorded,
    /// The witness id was already recorded through either channel.
    Duplicate,
    /// The activity is older than the recency window.
    Stale,
}

/// Lifecycle of a watched subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectState {
    Idle,
    /// Push and poll channels are both active.
    Armed,
    /// A signal for this subject is still within its TTL.
    Signaled,
}

impl std::fmt::Display for SubjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Armed => write!(f, "armed"),
            Self::Signaled => write!(f, "signaled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectorStats {
    pub signals_recorded: u64,
    pub duplicates: u64,
    pub stale_dropped: u64,
    pub hints: u64,
    pub poll_errors: u64,
    pub cache_len: usize,
}

/// Where and what to watch.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub config: DetectorConfig,
    /// Feeds carrying the push rooms. A subject pinned to a feed is only
    /// subscribed there; an unpinned one on every feed.
    pub feeds: Vec<FeedConfig>,
    pub subjects: Vec<TrackedSubject>,
}

#[derive(Default)]
struct Counters {
    recorded: AtomicU64,
    duplicates: AtomicU64,
    stale: AtomicU64,
    hints: AtomicU64,
    poll_errors: AtomicU64,
}

#[derive(Default)]
struct RunState {
    running: bool,
    cancel: CancellationToken,
    subscriptions: Vec<SubscriptionHandle>,
    /// Subjects with a live push subscription.
    push_active: HashSet<String>,
    /// Subjects with a running poll task.
    poll_active: HashSet<String>,
}

struct Inner {
    settings: DetectorSettings,
    mux: Arc<Multiplexer>,
    probe: Option<Arc<dyn ActivityProbe>>,
    bus: EventBus,
    clock: SharedClock,
    /// Recorded signals keyed by target id.
    signals: TtlCache<String, Signal>,
    /// Witness ids already recorded.
    witnesses: TtlCache<String, ()>,
    /// Last witness each subject's poll saw; present once a baseline exists.
    last_polled: Mutex<HashMap<String, Option<String>>>,
    /// When each subject last produced a signal.
    last_signal_at: Mutex<HashMap<String, u64>>,
    run: Mutex<RunState>,
    counters: Counters,
}

/// Watches subjects on push and poll channels and records signals.
#[derive(Clone)]
pub struct Detector {
    inner: Arc<Inner>,
}

impl Detector {
    /// `probe` may be `None`, in which case only the push channel runs and
    /// push hints cannot be followed up.
    pub fn new(
        settings: DetectorSettings,
        mux: Arc<Multiplexer>,
        probe: Option<Arc<dyn ActivityProbe>>,
        bus: EventBus,
        clock: SharedClock,
    ) -> Self {
        let cfg = &settings.config;
        let signals = TtlCache::new(clock.clone(), cfg.signal_ttl, cfg.cache_capacity);
        // a duplicate can only arrive within the recency window of its witness
        let witnesses = TtlCache::new(clock.clone(), cfg.recency * 2, cfg.cache_capacity * 4);
        Self {
            inner: Arc::new(Inner {
                settings,
                mux,
                probe,
                bus,
                clock,
                signals,
                witnesses,
                last_polled: Mutex::new(HashMap::new()),
                last_signal_at: Mutex::new(HashMap::new()),
                run: Mutex::new(RunState::default()),
                counters: Counters::default(),
            }),
        }
    }

    /// Subscribe push rooms and start poll tasks for every enabled subject.
    /// Calling `start` while running does nothing.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FeedError::Connection(format!("no async runtime: {e}")))?;
        let mut run = lock(&inner.run);
        if run.running {
            tracing::debug!("detector already running");
            return Ok(());
        }

        let subjects: Vec<TrackedSubject> =
            inner.settings.subjects.iter().filter(|s| s.enabled).cloned().collect();
        let mut started = Vec::new();
        for subject in &subjects {
            let feeds = inner.settings.feeds.iter().filter(|f| subject.watches_feed(&f.name));
            for feed in feeds {
                match inner.mux.subscribe(&feed.endpoint, &feed.room(&subject.id)) {
                    Ok((handle, rx)) => {
                        started.push(handle);
                        run.push_active.insert(subject.id.clone());
                        runtime.spawn(push_loop(inner.clone(), subject.clone(), rx, run.cancel.child_token()));
                    }
                    Err(e) => {
                        // nothing is half-started: undo what this call subscribed
                        run.cancel.cancel();
                        for handle in &started {
                            let _ = inner.mux.unsubscribe(handle);
                        }
                        *run = RunState::default();
                        return Err(e);
                    }
                }
            }
            if !run.push_active.contains(&subject.id) {
                tracing::warn!(subject = %subject.label(), feed = ?subject.feed, "no feed carries this subject");
            }
            if inner.probe.is_some() {
                run.poll_active.insert(subject.id.clone());
                runtime.spawn(poll_loop(inner.clone(), subject.clone(), run.cancel.child_token()));
            }
        }
        run.subscriptions = started;
        run.running = true;
        tracing::info!(
            subjects = subjects.len(),
            rooms = run.subscriptions.len(),
            poll = inner.probe.is_some(),
            interval_ms = inner.settings.config.poll_interval.as_millis() as u64,
            "detector started"
        );
        Ok(())
    }

    /// Cancel timers and scheduled evictions, leave push rooms, clear caches.
    /// Never blocks.
    pub fn stop(&self) {
        let inner = &self.inner;
        let run = std::mem::take(&mut *lock(&inner.run));
        run.cancel.cancel();
        for handle in &run.subscriptions {
            if let Err(e) = inner.mux.unsubscribe(handle) {
                tracing::debug!(topic = %handle.topic, error = %e, "unsubscribe on stop failed");
            }
        }
        inner.signals.clear();
        inner.witnesses.clear();
        lock(&inner.last_polled).clear();
        lock(&inner.last_signal_at).clear();
        if run.running {
            tracing::info!("detector stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.run).running
    }

    /// Admit a signal: recency check, witness dedup, cache, schedule
    /// eviction, publish.
    pub fn record_signal(&self, signal: Signal) -> RecordOutcome {
        record(&self.inner, signal)
    }

    /// The signal recorded for `target_id`, if it is younger than `max_age`
    /// (default: the signal TTL).
    pub fn get_fresh_signal(&self, target_id: &str, max_age: Option<Duration>) -> Option<Signal> {
        let entry = self.inner.signals.get_entry(&target_id.to_owned())?;
        if let Some(max_age) = max_age {
            if entry.age_ms(self.inner.clock.now_ms()) > max_age.as_millis() as u64 {
                return None;
            }
        }
        Some(entry.value)
    }

    pub fn subject_state(&self, subject_id: &str) -> SubjectState {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let ttl_ms = inner.settings.config.signal_ttl.as_millis() as u64;
        let signaled = lock(&inner.last_signal_at)
            .get(subject_id)
            .is_some_and(|at| now.saturating_sub(*at) < ttl_ms);
        if signaled {
            return SubjectState::Signaled;
        }
        let run = lock(&inner.run);
        if run.push_active.contains(subject_id) && run.poll_active.contains(subject_id) {
            SubjectState::Armed
        } else {
            SubjectState::Idle
        }
    }

    pub fn stats(&self) -> DetectorStats {
        let c = &self.inner.counters;
        DetectorStats {
            signals_recorded: c.recorded.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            stale_dropped: c.stale.load(Ordering::Relaxed),
            hints: c.hints.load(Ordering::Relaxed),
            poll_errors: c.poll_errors.load(Ordering::Relaxed),
            cache_len: self.inner.signals.live_len(),
        }
    }
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("subjects", &self.inner.settings.subjects.len())
            .field("running", &self.is_running())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record(inner: &Arc<Inner>, signal: Signal) -> RecordOutcome {
    let now = inner.clock.now_ms();
    let recency_ms = inner.settings.config.recency.as_millis() as u64;
    if now.saturating_sub(signal.timestamp_ms) > recency_ms {
        inner.counters.stale.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            witness = %signal.witness_id,
            age_ms = now.saturating_sub(signal.timestamp_ms),
            "stale activity dropped"
        );
        return RecordOutcome::Stale;
    }
    if !inner.witnesses.try_insert(signal.witness_id.clone(), ()) {
        inner.counters.duplicates.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(witness = %signal.witness_id, channel = %signal.channel, "duplicate witness");
        return RecordOutcome::Duplicate;
    }

    let ttl = inner.settings.config.signal_ttl;
    inner.signals.insert_with_ttl(signal.target_id.clone(), signal.clone(), ttl);
    lock(&inner.last_signal_at).insert(signal.subject_id.clone(), now);
    schedule_eviction(inner, &signal, ttl);
    inner.counters.recorded.fetch_add(1, Ordering::Relaxed);

    tracing::info!(
        subject = %signal.subject_id,
        target_id = %signal.target_id,
        action = %signal.action,
        channel = %signal.channel,
        confidence = %signal.confidence,
        "signal recorded"
    );
    inner.bus.publish(Event::Signal(Arc::new(signal)));
    RecordOutcome::Recorded
}

fn schedule_eviction(inner: &Arc<Inner>, signal: &Signal, ttl: Duration) {
    // outside a runtime, lazy expiry alone keeps the entry invisible
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let cancel = lock(&inner.run).cancel.child_token();
    let target = signal.target_id.clone();
    let witness = signal.witness_id.clone();
    let inner = Arc::clone(inner);
    runtime.spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(ttl) => {
                inner.signals.remove_if(&target, |e| e.value.witness_id == witness);
            }
        }
    });
}

fn signal_from(subject: &TrackedSubject, activity: Activity, channel: Channel, confidence: Confidence) -> Signal {
    Signal {
        subject_id: subject.id.clone(),
        target_id: activity.target_id,
        action: activity.action,
        magnitude: activity.magnitude,
        channel,
        confidence,
        timestamp_ms: activity.timestamp_ms,
        witness_id: activity.witness_id,
    }
}

async fn push_loop(
    inner: Arc<Inner>,
    subject: TrackedSubject,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => on_push(&inner, &subject, frame).await,
                None => break,
            },
        }
    }
    tracing::debug!(subject = %subject.label(), "push channel closed");
}

async fn on_push(inner: &Arc<Inner>, subject: &TrackedSubject, frame: Frame) {
    if let Some(activity) = Activity::from_value(&frame.payload) {
        record(inner, signal_from(subject, activity, Channel::Push, Confidence::High));
        return;
    }

    // incomplete record: treat as a hint and look right away
    inner.counters.hints.fetch_add(1, Ordering::Relaxed);
    let Some(probe) = &inner.probe else {
        tracing::debug!(subject = %subject.label(), "push hint ignored, no probe configured");
        return;
    };
    match probe.latest(subject).await {
        Ok(Some(activity)) => {
            lock(&inner.last_polled).insert(subject.id.clone(), Some(activity.witness_id.clone()));
            record(inner, signal_from(subject, activity, Channel::Push, Confidence::Medium));
        }
        Ok(None) => {}
        Err(e) => {
            inner.counters.poll_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(subject = %subject.label(), error = %e, "hint probe failed");
        }
    }
}

async fn poll_loop(inner: Arc<Inner>, subject: TrackedSubject, cancel: CancellationToken) {
    let Some(probe) = inner.probe.clone() else {
        return;
    };
    let mut interval = tokio::time::interval(inner.settings.config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = probe.latest(&subject) => r,
        };
        match result {
            Ok(latest) => {
                let witness = latest.as_ref().map(|a| a.witness_id.clone());
                let previous = lock(&inner.last_polled).insert(subject.id.clone(), witness.clone());
                match (previous, latest) {
                    (None, _) => {
                        tracing::debug!(subject = %subject.label(), baseline = ?witness, "poll baseline");
                    }
                    (Some(prev), Some(activity)) if prev.as_deref() != Some(activity.witness_id.as_str()) => {
                        record(&inner, signal_from(&subject, activity, Channel::Poll, Confidence::Medium));
                    }
                    _ => {}
                }
            }
            Err(e) => {
                inner.counters.poll_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(subject = %subject.label(), error = %e, "poll failed");
            }
        }
    }
    tracing::debug!(subject = %subject.label(), "poll channel stopped");
}
