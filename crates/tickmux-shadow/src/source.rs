//! Read-only upstream sources polled by the shadow loop.

use async_trait::async_trait;
use serde_json::{json, Value};

use tickmux_core::config::{validate_endpoint, ShadowConfig};
use tickmux_core::{FeedError, Result};

/// Which of the two feeds to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    Primary,
    Secondary,
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// A pair of read-only feeds plus an optional auth handshake.
#[async_trait]
pub trait ShadowSource: Send + Sync + 'static {
    /// Exchange credentials for an access token. `Ok(None)` means the
    /// source has no auth configured and runs anonymously.
    async fn handshake(&self) -> Result<Option<String>>;

    /// Fetch one feed; `token` is `None` in anonymous mode.
    async fn fetch(&self, kind: FeedKind, token: Option<&str>) -> Result<Value>;
}

/// HTTP implementation over `reqwest`.
pub struct HttpShadowSource {
    primary_url: String,
    secondary_url: String,
    auth_url: Option<String>,
    refresh_token: Option<String>,
    http: reqwest::Client,
}

impl HttpShadowSource {
    pub fn new(config: &ShadowConfig) -> Result<Self> {
        let (Some(primary), Some(secondary)) = (&config.primary_url, &config.secondary_url) else {
            return Err(FeedError::Config("shadow needs primary_url and secondary_url".into()));
        };
        for url in [primary, secondary] {
            validate_endpoint(url, &["http", "https"])?;
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FeedError::Config(format!("http client: {e}")))?;
        Ok(Self {
            primary_url: primary.clone(),
            secondary_url: secondary.clone(),
            auth_url: config.auth_url.clone(),
            refresh_token: config.refresh_token.clone(),
            http,
        })
    }

    pub fn url_for(&self, kind: FeedKind) -> &str {
        match kind {
            FeedKind::Primary => &self.primary_url,
            FeedKind::Secondary => &self.secondary_url,
        }
    }
}

#[async_trait]
impl ShadowSource for HttpShadowSource {
    async fn handshake(&self) -> Result<Option<String>> {
        let (Some(url), Some(refresh)) = (&self.auth_url, &self.refresh_token) else {
            return Ok(None);
        };
        let resp = self
            .http
            .post(url)
            .json(&json!({ "refresh_token": refresh }))
            .send()
            .await
            .map_err(|e| FeedError::Handshake(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Handshake(format!("auth endpoint returned {status}")));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| FeedError::Handshake(format!("auth response: {e}")))?;
        access_token(&body)
            .map(Some)
            .ok_or_else(|| FeedError::Handshake("auth response carried no access token".into()))
    }

    async fn fetch(&self, kind: FeedKind, token: Option<&str>) -> Result<Value> {
        let mut req = self.http.get(self.url_for(kind));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::enrichment(Some(status.as_u16()), format!("{kind} feed")));
        }
        resp.json()
            .await
            .map_err(|e| FeedError::MalformedPayload(e.to_string()))
    }
}

fn access_token(body: &Value) -> Option<String> {
    ["access_token", "accessToken", "token"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
}
