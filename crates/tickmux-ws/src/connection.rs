//! One physical upstream connection and the background task that owns it.
//!
//! The task connects, replays a join for every active topic, then loops over
//! caller commands and inbound frames. Handles enqueue a `Join` or `Leave`
//! at the moment the registry sees a topic's 0→1 or →0 transition, so the
//! task applies them in transition order. On a read error or unexpected
//! close it waits according to the backoff policy and reconnects;
//! subscribers stay attached throughout.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tickmux_core::{
    BackoffPolicy, ConnectionState, ConnectionStateChange, Event, EventBus, FeedError, Result,
    SharedClock,
};

use crate::connector::{Connector, FrameSink, FrameStream};
use crate::frame::{self, Frame};
use crate::registry::{SubscriptionId, TopicRegistry};

/// Command sent from handles to the connection task.
#[derive(Debug)]
enum Command {
    /// The topic gained its first consumer.
    Join(String),
    /// The topic lost its last consumer.
    Leave(String),
    Publish(String),
    Close,
}

/// Back-reference from a consumer to its subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub endpoint: String,
    pub topic: String,
    pub id: SubscriptionId,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionHealth {
    pub endpoint: String,
    pub state: ConnectionState,
    pub reconnects: u64,
    pub failed_attempts: u64,
    pub active_topics: usize,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_malformed: u64,
}

struct Shared {
    endpoint: String,
    state: Mutex<ConnectionState>,
    reconnects: AtomicU64,
    failed_attempts: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    frames_malformed: AtomicU64,
    bus: Option<EventBus>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        {
            let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == state {
                return;
            }
            *current = state;
        }
        tracing::debug!(endpoint = %self.endpoint, %state, "connection state");
        if let Some(bus) = &self.bus {
            bus.publish(Event::ConnectionState(ConnectionStateChange {
                endpoint: self.endpoint.clone(),
                state,
                reconnects: self.reconnects.load(Ordering::Relaxed),
            }));
        }
    }
}

/// Caller-side handle to a connection. Dropping the last handle closes it.
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    registry: TopicRegistry,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

/// Everything the background task needs besides its command receiver.
pub(crate) struct ConnectionParams {
    pub endpoint: String,
    pub connector: Arc<dyn Connector>,
    pub policy: BackoffPolicy,
    pub clock: SharedClock,
    pub bus: Option<EventBus>,
    pub cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Spawn the connection task on the current runtime.
    pub(crate) fn spawn(params: ConnectionParams) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FeedError::Connection(format!("no async runtime: {e}")))?;

        let shared = Arc::new(Shared {
            endpoint: params.endpoint.clone(),
            state: Mutex::new(ConnectionState::Connecting),
            reconnects: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_malformed: AtomicU64::new(0),
            bus: params.bus.clone(),
        });
        let registry = TopicRegistry::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = ConnectionTask {
            shared: shared.clone(),
            registry: registry.clone(),
            params,
        };
        runtime.spawn(task.run(cmd_rx));

        Ok(Self {
            shared,
            registry,
            cmd_tx,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Attach a consumer to `topic`. The first consumer causes a join.
    pub fn subscribe(&self, topic: &str) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<Frame>)> {
        if topic.is_empty() {
            return Err(FeedError::InvalidArgument("topic must not be empty".into()));
        }
        let (id, rx, count) = self
            .registry
            .register(topic, |t| self.send(Command::Join(t.to_owned())))?;
        tracing::debug!(endpoint = %self.shared.endpoint, topic, refcount = count, "subscribed");
        Ok((
            SubscriptionHandle {
                endpoint: self.shared.endpoint.clone(),
                topic: topic.to_owned(),
                id,
            },
            rx,
        ))
    }

    /// Detach a consumer. The last consumer of a topic causes a leave.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        if handle.endpoint != self.shared.endpoint {
            return Err(FeedError::InvalidArgument(format!(
                "{} belongs to {}, not {}",
                handle.id, handle.endpoint, self.shared.endpoint
            )));
        }
        let endpoint = &self.shared.endpoint;
        let (topic, remaining) = self
            .registry
            .remove(handle.id, |t| {
                // a closed task has nothing left to leave
                if self.send(Command::Leave(t.to_owned())).is_err() {
                    tracing::debug!(endpoint = %endpoint, topic = t, "leave skipped, connection closed");
                }
            })
            .ok_or_else(|| {
                FeedError::InvalidArgument(format!("{} is not subscribed to {}", handle.id, handle.topic))
            })?;
        tracing::debug!(endpoint = %endpoint, topic = %topic, refcount = remaining, "unsubscribed");
        Ok(())
    }

    /// Enqueue a raw text payload. Fails fast unless the connection is open.
    pub fn publish(&self, payload: impl Into<String>) -> Result<()> {
        if !self.is_open() {
            return Err(FeedError::NotConnected {
                endpoint: self.shared.endpoint.clone(),
            });
        }
        self.send(Command::Publish(payload.into()))
    }

    /// Leave every active room and close. Returns immediately.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    pub fn active_topics(&self) -> Vec<String> {
        self.registry.active_topics()
    }

    pub fn health(&self) -> ConnectionHealth {
        let s = &self.shared;
        ConnectionHealth {
            endpoint: s.endpoint.clone(),
            state: s.state(),
            reconnects: s.reconnects.load(Ordering::Relaxed),
            failed_attempts: s.failed_attempts.load(Ordering::Relaxed),
            active_topics: self.registry.active_topics().len(),
            frames_received: s.frames_received.load(Ordering::Relaxed),
            frames_dropped: s.frames_dropped.load(Ordering::Relaxed),
            frames_malformed: s.frames_malformed.load(Ordering::Relaxed),
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| FeedError::NotConnected {
            endpoint: self.shared.endpoint.clone(),
        })
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

/// How a session ended.
enum SessionEnd {
    /// Caller asked to close; do not reconnect.
    Closed,
    /// Transport failed; reconnect after backoff.
    Dropped,
}

struct ConnectionTask {
    shared: Arc<Shared>,
    registry: TopicRegistry,
    params: ConnectionParams,
}

type CommandRx = mpsc::UnboundedReceiver<Command>;

impl ConnectionTask {
    async fn run(self, mut cmd_rx: CommandRx) {
        let endpoint = self.shared.endpoint.clone();
        let mut attempt: u32 = 0;
        let mut sessions: u64 = 0;

        loop {
            if attempt == 0 {
                self.shared.set_state(ConnectionState::Connecting);
            }
            tracing::info!(endpoint = %endpoint, attempt, "connecting");

            let connected = tokio::select! {
                _ = self.params.cancel.cancelled() => break,
                res = self.params.connector.connect(&endpoint) => res,
            };

            match connected {
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    self.shared.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(endpoint = %endpoint, attempt, error = %e, "connect failed");
                }
                Ok((sink, stream)) => {
                    if sessions > 0 {
                        self.shared.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    sessions += 1;
                    attempt = 0;
                    self.shared.set_state(ConnectionState::Open);
                    tracing::info!(endpoint = %endpoint, session = sessions, "connection open");

                    match self.session(&mut cmd_rx, sink, stream).await {
                        SessionEnd::Closed => break,
                        SessionEnd::Dropped => {
                            attempt = 1;
                            tracing::warn!(endpoint = %endpoint, "connection lost");
                        }
                    }
                }
            }

            self.shared.set_state(ConnectionState::Reconnecting);
            if !self.backoff(&mut cmd_rx, attempt).await {
                break;
            }
        }

        self.shared.set_state(ConnectionState::Closed);
        tracing::info!(endpoint = %endpoint, "connection closed");
    }

    /// Sleep before the next attempt. Returns `false` if asked to stop.
    async fn backoff(&self, cmd_rx: &mut CommandRx, attempt: u32) -> bool {
        let delay = self.params.policy.next_delay(attempt);
        tracing::warn!(
            endpoint = %self.shared.endpoint,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnecting after backoff"
        );
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.params.cancel.cancelled() => return false,
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Command::Close) => return false,
                    Some(Command::Publish(_)) => {
                        tracing::debug!(endpoint = %self.shared.endpoint, "publish dropped while reconnecting");
                    }
                    // the next session replays rooms from the registry, so a
                    // join and leave queued while down cancel out
                    Some(Command::Join(_)) | Some(Command::Leave(_)) => {}
                },
            }
        }
    }

    async fn session(
        &self,
        cmd_rx: &mut CommandRx,
        mut sink: FrameSink,
        mut stream: FrameStream,
    ) -> SessionEnd {
        let endpoint = self.shared.endpoint.clone();
        let mut joined: HashSet<String> = HashSet::new();

        for topic in self.registry.active_topics() {
            if let Err(e) = sink.send(frame::join_frame(&topic)).await {
                tracing::warn!(endpoint = %endpoint, topic = %topic, error = %e, "rejoin failed");
                return SessionEnd::Dropped;
            }
            joined.insert(topic);
        }
        if !joined.is_empty() {
            tracing::info!(endpoint = %endpoint, topics = joined.len(), "rooms rejoined");
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Command::Close) => {
                        self.close(sink, joined).await;
                        return SessionEnd::Closed;
                    }
                    Some(Command::Join(topic)) => {
                        // already joined by the replay when queued before this session
                        if !joined.contains(&topic) {
                            if let Err(e) = sink.send(frame::join_frame(&topic)).await {
                                tracing::warn!(endpoint = %endpoint, topic = %topic, error = %e, "join failed");
                                return SessionEnd::Dropped;
                            }
                            tracing::debug!(endpoint = %endpoint, topic = %topic, "joined");
                            joined.insert(topic);
                        }
                    }
                    Some(Command::Leave(topic)) => {
                        if joined.remove(&topic) {
                            if let Err(e) = sink.send(frame::leave_frame(&topic)).await {
                                tracing::warn!(endpoint = %endpoint, topic = %topic, error = %e, "leave failed");
                                return SessionEnd::Dropped;
                            }
                            tracing::debug!(endpoint = %endpoint, topic = %topic, "left");
                        }
                    }
                    Some(Command::Publish(text)) => {
                        if let Err(e) = sink.send(text).await {
                            tracing::warn!(endpoint = %endpoint, error = %e, "publish failed");
                            return SessionEnd::Dropped;
                        }
                    }
                },
                msg = stream.next() => match msg {
                    None => return SessionEnd::Dropped,
                    Some(Ok(text)) => self.on_text(&text),
                    Some(Err(FeedError::MalformedPayload(reason))) => {
                        self.shared.frames_malformed.fetch_add(1, Ordering::Relaxed);
                        self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(endpoint = %endpoint, reason = %reason, "malformed frame dropped");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(endpoint = %endpoint, error = %e, "receive error");
                        return SessionEnd::Dropped;
                    }
                },
            }
        }
    }

    fn on_text(&self, text: &str) {
        self.shared.frames_received.fetch_add(1, Ordering::Relaxed);
        match frame::decode(text, self.params.clock.now_ms()) {
            Ok(Some(frame)) => {
                let topic = frame.topic.clone();
                if self.registry.dispatch(frame) == 0 {
                    self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(endpoint = %self.shared.endpoint, topic = %topic, "no subscribers");
                }
            }
            Ok(None) => {
                self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(endpoint = %self.shared.endpoint, "frame without topic dropped");
            }
            Err(e) => {
                self.shared.frames_malformed.fetch_add(1, Ordering::Relaxed);
                self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(endpoint = %self.shared.endpoint, error = %e, "malformed frame dropped");
            }
        }
    }

    async fn close(&self, mut sink: FrameSink, joined: HashSet<String>) {
        self.shared.set_state(ConnectionState::Closing);
        let mut topics: Vec<String> = joined.into_iter().collect();
        topics.sort();
        for topic in topics {
            if let Err(e) = sink.send(frame::leave_frame(&topic)).await {
                tracing::debug!(endpoint = %self.shared.endpoint, topic = %topic, error = %e, "leave on close failed");
                break;
            }
        }
        let _ = sink.close().await;
    }
}
