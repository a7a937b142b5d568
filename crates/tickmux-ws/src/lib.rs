//! tickmux-ws — shared-connection WebSocket multiplexer.
//!
//! # Features
//! - One physical connection per endpoint, shared by every consumer
//! - Ref-counted rooms: join on the first subscriber, leave after the last
//! - Auto-reconnect with exponential backoff and jitter
//! - Rooms rejoined after reconnect without consumers re-registering
//! - Per-topic delivery in wire order

pub mod connection;
pub mod connector;
pub mod frame;
pub mod mux;
pub mod registry;

pub use connection::{ConnectionHandle, ConnectionHealth, SubscriptionHandle};
pub use connector::{Connector, FrameSink, FrameStream, WsConnector};
pub use frame::Frame;
pub use mux::Multiplexer;
pub use registry::{SubscriptionId, TopicRegistry};
