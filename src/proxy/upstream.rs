//! HTTP client for forwarding requests to upstream LLM providers.
//!
//! One shared client with connection pooling, created at startup and never
//! per-request. Errors are classified into the two failure modes the proxy
//! must keep separate: connectivity failures (→ 502, no block header) and
//! malformed upstream URLs (→ 500, operator config error). Upstream 4xx/5xx
//! responses are not errors here — they pass through to the agent as-is.

use std::time::Duration;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection refused, DNS failure, timeout, invalid HTTP from the
    /// upstream. Maps to HTTP 502 — never to a policy block.
    #[error("upstream unavailable: {kind}")]
    Unavailable { kind: &'static str },

    /// The configured upstream URL does not parse. Maps to HTTP 500.
    #[error("invalid upstream url: {0}")]
    BadUrl(String),
}

impl UpstreamError {
    /// Short error-kind label for the 502 body's `detail` field.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Unavailable { kind } => kind,
            UpstreamError::BadUrl(_) => "bad_url",
        }
    }
}

pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            // Pass 3xx through to the agent; the proxy does not resolve them.
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Forward a request byte-for-byte. Query strings and body are already
    /// part of `url`/`body`; headers come pre-sanitised from
    /// `headers::build_upstream_headers`.
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, UpstreamError> {
        if url::Url::parse(url).is_err() {
            return Err(UpstreamError::BadUrl(url.to_string()));
        }

        self.client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(classify_error)
    }
}

fn classify_error(e: reqwest::Error) -> UpstreamError {
    let kind = if e.is_connect() {
        "connect"
    } else if e.is_timeout() {
        "timeout"
    } else if e.is_builder() || e.is_request() {
        // Builder errors at send time mean the URL/parts were unusable.
        return UpstreamError::BadUrl(e.to_string());
    } else {
        // Invalid HTTP from the upstream, broken transfer, etc.
        "protocol"
    };
    tracing::warn!(error = %e, kind, "upstream request failed");
    UpstreamError::Unavailable { kind }
}
