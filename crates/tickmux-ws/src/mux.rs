//! The connection multiplexer.
//!
//! Owns at most one physical connection per endpoint and hands out
//! ref-counted topic subscriptions on top of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tickmux_core::{system_clock, BackoffConfig, BackoffPolicy, EventBus, FeedError, Result, SharedClock};

use crate::connection::{ConnectionHandle, ConnectionHealth, ConnectionParams, SubscriptionHandle};
use crate::connector::Connector;
use crate::frame::Frame;

/// Shares physical connections between any number of topic consumers.
pub struct Multiplexer {
    connector: Arc<dyn Connector>,
    policy: BackoffPolicy,
    endpoint_policies: HashMap<String, BackoffPolicy>,
    clock: SharedClock,
    bus: Option<EventBus>,
    connections: Mutex<HashMap<String, Arc<ConnectionHandle>>>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl Multiplexer {
    pub fn new(connector: Arc<dyn Connector>, backoff: BackoffConfig) -> Self {
        Self {
            connector,
            policy: BackoffPolicy::new(backoff),
            endpoint_policies: HashMap::new(),
            clock: system_clock(),
            bus: None,
            connections: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Reconnect backoff for `endpoint` instead of the shared default.
    pub fn with_endpoint_backoff(mut self, endpoint: impl Into<String>, backoff: BackoffConfig) -> Self {
        self.endpoint_policies.insert(endpoint.into(), BackoffPolicy::new(backoff));
        self
    }

    /// Publish connection state changes on `bus`.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Clock used to stamp inbound frames.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Cancel this multiplexer together with `parent`.
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Return the connection for `endpoint`, creating it if needed.
    pub fn shared_connection(&self, endpoint: &str) -> Result<Arc<ConnectionHandle>> {
        validate_endpoint(endpoint)?;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(FeedError::InvalidArgument("multiplexer is shut down".into()));
        }

        // creation happens under the map lock so racing callers converge
        let mut connections = self.lock();
        if let Some(conn) = connections.get(endpoint) {
            return Ok(conn.clone());
        }
        let conn = Arc::new(ConnectionHandle::spawn(ConnectionParams {
            endpoint: endpoint.to_owned(),
            connector: self.connector.clone(),
            policy: self.endpoint_policies.get(endpoint).unwrap_or(&self.policy).clone(),
            clock: self.clock.clone(),
            bus: self.bus.clone(),
            cancel: self.cancel.child_token(),
        })?);
        connections.insert(endpoint.to_owned(), conn.clone());
        tracing::info!(endpoint, total = connections.len(), "shared connection created");
        Ok(conn)
    }

    /// Subscribe to `topic` on `endpoint`'s shared connection.
    pub fn subscribe(
        &self,
        endpoint: &str,
        topic: &str,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<Frame>)> {
        self.shared_connection(endpoint)?.subscribe(topic)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let conn = self.lock().get(&handle.endpoint).cloned().ok_or_else(|| {
            FeedError::InvalidArgument(format!("no connection for {}", handle.endpoint))
        })?;
        conn.unsubscribe(handle)
    }

    /// Send `payload` on `endpoint`'s connection. Fails fast with
    /// [`FeedError::NotConnected`] unless that connection is open.
    pub fn publish(&self, endpoint: &str, payload: &Value) -> Result<()> {
        let conn = self
            .lock()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| FeedError::NotConnected {
                endpoint: endpoint.to_owned(),
            })?;
        conn.publish(payload.to_string())
    }

    pub fn health(&self) -> Vec<ConnectionHealth> {
        let mut health: Vec<_> = self.lock().values().map(|c| c.health()).collect();
        health.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        health
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Close every connection with best-effort leave frames. Non-blocking.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections: Vec<_> = self.lock().drain().map(|(_, c)| c).collect();
        tracing::info!(connections = connections.len(), "multiplexer shutting down");
        for conn in &connections {
            conn.shutdown();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ConnectionHandle>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    if endpoint.trim().is_empty() {
        return Err(FeedError::InvalidArgument("endpoint must not be empty".into()));
    }
    let url = url::Url::parse(endpoint)
        .map_err(|e| FeedError::InvalidArgument(format!("invalid endpoint {endpoint:?}: {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(FeedError::InvalidArgument(format!(
            "endpoint {endpoint:?} is not a ws:// or wss:// URL"
        )));
    }
    Ok(())
}
