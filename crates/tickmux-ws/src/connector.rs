//! Transport seam: how a connection obtains a text frame sink and stream.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use tickmux_core::{FeedError, Result};

/// Outbound half of a framed text connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = FeedError> + Send>>;
/// Inbound half of a framed text connection. Ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens framed text connections to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<(FrameSink, FrameStream)>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
///
/// Pings are answered by the protocol layer; only text (and UTF-8 binary)
/// messages reach the stream. Handshake headers are the shared set plus any
/// set registered for the endpoint, the latter winning on conflicts.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    headers: BTreeMap<String, String>,
    per_endpoint: HashMap<String, BTreeMap<String, String>>,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra handshake headers, e.g. `Origin` or `Cookie`.
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Headers sent only when connecting to `endpoint`.
    pub fn with_endpoint_headers(
        mut self,
        endpoint: impl Into<String>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        self.per_endpoint.insert(endpoint.into(), headers);
        self
    }

    /// The handshake headers used for `endpoint`.
    pub fn headers_for(&self, endpoint: &str) -> BTreeMap<String, String> {
        let mut headers = self.headers.clone();
        if let Some(extra) = self.per_endpoint.get(endpoint) {
            headers.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        headers
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<(FrameSink, FrameStream)> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| FeedError::InvalidArgument(format!("{endpoint}: {e}")))?;
        for (name, value) in &self.headers_for(endpoint) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FeedError::InvalidArgument(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| FeedError::InvalidArgument(format!("header {name}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))?;
        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(|e| FeedError::Connection(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, FeedError>(Message::Text(text.into()))));

        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => Some(Err(FeedError::MalformedPayload(
                        "non UTF-8 binary frame".into(),
                    ))),
                },
                Ok(Message::Close(_)) => Some(Err(FeedError::Connection("closed by peer".into()))),
                Ok(_) => None,
                Err(e) => Some(Err(FeedError::Connection(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn endpoint_headers_extend_and_override_shared() {
        let connector = WsConnector::new()
            .with_headers(map(&[("User-Agent", "tickmux"), ("Origin", "https://shared.io")]))
            .with_endpoint_headers("wss://a.io/ws", map(&[("Origin", "https://a.io")]))
            .with_endpoint_headers("wss://b.io/ws", map(&[("Cookie", "k=v")]));

        let a = connector.headers_for("wss://a.io/ws");
        assert_eq!(a["Origin"], "https://a.io");
        assert_eq!(a["User-Agent"], "tickmux");

        let b = connector.headers_for("wss://b.io/ws");
        assert_eq!(b["Origin"], "https://shared.io");
        assert_eq!(b["Cookie"], "k=v");

        assert_eq!(connector.headers_for("wss://c.io/ws").len(), 2);
    }
}
