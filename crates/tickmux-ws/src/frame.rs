//! Inbound frame decoding and outbound control frames.
//!
//! The upstream speaks text JSON. Scoped messages arrive as
//! `{"room": <topic>, "content": <payload>}`; anything else is routed by
//! looking for a topic under one of [`TOPIC_KEYS`].

use serde::Serialize;
use serde_json::{json, Value};

use tickmux_core::{FeedError, Result};

/// Keys tried, in order, when an inbound payload has no `room`.
pub const TOPIC_KEYS: [&str; 4] = ["topic", "channel", "stream", "type"];

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub topic: String,
    pub payload: Value,
    /// Arrival time, ms since epoch.
    pub received_at_ms: u64,
}

/// Decode one text message.
///
/// Returns `Ok(None)` when the message is valid JSON but names no topic.
/// Text that is not JSON at all is a [`FeedError::MalformedPayload`].
pub fn decode(text: &str, received_at_ms: u64) -> Result<Option<Frame>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| FeedError::MalformedPayload(format!("{e} (len={})", text.len())))?;
    Ok(route(value, received_at_ms))
}

fn route(mut value: Value, received_at_ms: u64) -> Option<Frame> {
    let obj = value.as_object_mut()?;

    if let Some(room) = obj.get("room").and_then(Value::as_str).map(str::to_owned) {
        let payload = match obj.remove("content") {
            Some(content) => content,
            None => {
                obj.remove("room");
                value
            }
        };
        return Some(Frame {
            topic: room,
            payload,
            received_at_ms,
        });
    }

    let topic = TOPIC_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .filter(|t| !t.is_empty())?
        .to_owned();
    Some(Frame {
        topic,
        payload: value,
        received_at_ms,
    })
}

/// `{"action":"join","room":<topic>}`
pub fn join_frame(topic: &str) -> String {
    control_frame("join", topic)
}

/// `{"action":"leave","room":<topic>}`
pub fn leave_frame(topic: &str) -> String {
    control_frame("leave", topic)
}

fn control_frame(action: &str, topic: &str) -> String {
    json!({ "action": action, "room": topic }).to_string()
}
