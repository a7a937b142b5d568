//! Typed publish/subscribe bus for pipeline outputs.
//!
//! Handlers run synchronously, in registration order, on the publishing
//! task. A handler that panics is caught and logged; the remaining handlers
//! still receive the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use crate::types::{CanonicalTick, ConnectionStateChange, Signal};

/// Every event kind the pipeline emits.
#[derive(Debug, Clone)]
pub enum Event {
    Signal(Arc<Signal>),
    Tick(Arc<CanonicalTick>),
    ConnectionState(ConnectionStateChange),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Signal(_) => "signal",
            Self::Tick(_) => "tick",
            Self::ConnectionState(_) => "connection-state",
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Registration order is delivery order.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Mutex<Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every event kind.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Register a handler for signals only.
    pub fn on_signal<F>(&self, handler: F)
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        self.subscribe(move |e| {
            if let Event::Signal(s) = e {
                handler(s)
            }
        });
    }

    /// Register a handler for canonical ticks only.
    pub fn on_tick<F>(&self, handler: F)
    where
        F: Fn(&CanonicalTick) + Send + Sync + 'static,
    {
        self.subscribe(move |e| {
            if let Event::Tick(t) = e {
                handler(t)
            }
        });
    }

    /// Register a handler for connection state changes only.
    pub fn on_connection_state<F>(&self, handler: F)
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.subscribe(move |e| {
            if let Event::ConnectionState(c) = e {
                handler(c)
            }
        });
    }

    /// Deliver `event` to every handler. Returns how many handlers panicked.
    pub fn publish(&self, event: Event) -> usize {
        // copy-then-dispatch: a slow handler never blocks registration
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failed = 0;
        for (idx, handler) in handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                failed += 1;
                tracing::error!(handler = idx, kind = event.kind(), "event handler panicked");
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("handlers", &self.len()).finish()
    }
}
