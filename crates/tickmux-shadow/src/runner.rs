//! The shadow polling loop.
//!
//! One iteration at a time: handshake, both fetches concurrently, normalize,
//! publish ticks, then wait a fixed cadence. An iteration that fails is
//! logged and counted; the next one is scheduled regardless.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use tickmux_core::{Event, EventBus, FeedError, Result, SharedClock};

use crate::normalize::Normalizer;
use crate::source::{FeedKind, ShadowSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShadowStats {
    pub iterations: u64,
    /// Iterations in which at least one fetch failed.
    pub failures: u64,
    pub ticks_emitted: u64,
    /// Whether the most recent handshake produced a token.
    pub authenticated: bool,
}

#[derive(Default)]
struct Counters {
    iterations: AtomicU64,
    failures: AtomicU64,
    ticks: AtomicU64,
    authenticated: AtomicBool,
}

struct Inner {
    source: Arc<dyn ShadowSource>,
    normalizer: Normalizer,
    bus: EventBus,
    clock: SharedClock,
    cadence: Duration,
    counters: Counters,
}

/// Polls a [`ShadowSource`] on a fixed cadence and publishes
/// [`Event::Tick`]s.
pub struct ShadowLoop {
    inner: Arc<Inner>,
    cancel: Mutex<Option<CancellationToken>>,
    parent: CancellationToken,
}

impl ShadowLoop {
    pub fn new(
        source: Arc<dyn ShadowSource>,
        normalizer: Normalizer,
        bus: EventBus,
        clock: SharedClock,
        cadence: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                normalizer,
                bus,
                clock,
                cadence,
                counters: Counters::default(),
            }),
            cancel: Mutex::new(None),
            parent: CancellationToken::new(),
        }
    }

    /// Stop this loop together with `parent`.
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.parent = parent.child_token();
        self
    }

    /// Spawn the loop. Starting a running loop does nothing.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FeedError::Connection(format!("no async runtime: {e}")))?;
        let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return Ok(());
        }
        let token = self.parent.child_token();
        runtime.spawn(run(self.inner.clone(), token.clone()));
        *slot = Some(token);
        tracing::info!(cadence_ms = self.inner.cadence.as_millis() as u64, "shadow loop started");
        Ok(())
    }

    /// Cancel the loop. An iteration in flight is abandoned.
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().unwrap_or_else(PoisonError::into_inner).take() {
            token.cancel();
            tracing::info!("shadow loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Run a single iteration inline. Returns the number of ticks emitted.
    pub async fn run_once(&self) -> usize {
        iteration(&self.inner).await
    }

    pub fn stats(&self) -> ShadowStats {
        let c = &self.inner.counters;
        ShadowStats {
            iterations: c.iterations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            ticks_emitted: c.ticks.load(Ordering::Relaxed),
            authenticated: c.authenticated.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ShadowLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = iteration(&inner) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.cadence) => {}
        }
    }
    tracing::debug!("shadow loop exited");
}

async fn iteration(inner: &Inner) -> usize {
    let c = &inner.counters;
    c.iterations.fetch_add(1, Ordering::Relaxed);

    let token = match inner.source.handshake().await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(error = %e, "shadow handshake failed, continuing anonymously");
            None
        }
    };
    c.authenticated.store(token.is_some(), Ordering::Relaxed);

    let (primary, secondary) = tokio::join!(
        inner.source.fetch(FeedKind::Primary, token.as_deref()),
        inner.source.fetch(FeedKind::Secondary, token.as_deref()),
    );

    let now = inner.clock.now_ms();
    let mut emitted = 0;
    let mut failed = false;
    for (kind, result) in [(FeedKind::Primary, primary), (FeedKind::Secondary, secondary)] {
        match result {
            Ok(body) => {
                for tick in inner.normalizer.normalize(&body, now) {
                    inner.bus.publish(Event::Tick(Arc::new(tick)));
                    emitted += 1;
                }
            }
            Err(e) => {
                failed = true;
                tracing::warn!(feed = %kind, error = %e, "shadow fetch failed");
            }
        }
    }

    if failed {
        c.failures.fetch_add(1, Ordering::Relaxed);
    }
    c.ticks.fetch_add(emitted as u64, Ordering::Relaxed);
    tracing::debug!(ticks = emitted, failed, "shadow iteration done");
    emitted
}
