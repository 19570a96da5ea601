//! Header discipline for upstream requests and agent-facing responses.
//!
//! Upstream-bound: the OnGarde key (explicit header or `Bearer ong-*`) is
//! consumed at the proxy boundary and never forwarded; hop-by-hop headers
//! are stripped per RFC 7230 §6.1; everything else — including provider
//! `Authorization: Bearer sk-…` keys — passes through unchanged, and the
//! scan id is injected for correlation.
//!
//! Agent-bound: hop-by-hop headers are stripped; all other upstream
//! response headers are forwarded with their exact values. Rate-limit
//! headers (`x-ratelimit-*`, `retry-after`) drive agent backoff and must
//! never be rewritten.

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::auth::{ONGARDE_BEARER_PREFIX, ONGARDE_KEY_HEADER};
use crate::models::block::SCAN_ID_HEADER;

/// Hop-by-hop headers (RFC 7230 §6.1) plus `host` (derived from the
/// upstream URL) and `content-length` (recomputed from the body).
pub const HOP_BY_HOP_HEADERS: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Headers for the upstream request.
pub fn build_upstream_headers(request_headers: &HeaderMap, scan_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in request_headers.iter() {
        // OnGarde's own key header is consumed here, never forwarded.
        if name.as_str() == ONGARDE_KEY_HEADER {
            continue;
        }
        // Authorization carrying an OnGarde key is stripped; any other
        // Authorization (provider keys) passes through unchanged.
        if name.as_str() == "authorization" {
            if let Ok(auth) = value.to_str() {
                if auth.starts_with(ONGARDE_BEARER_PREFIX) {
                    continue;
                }
            }
        }
        if is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Ok(v) = HeaderValue::from_str(scan_id) {
        headers.insert(SCAN_ID_HEADER, v);
    }

    headers
}

/// Headers for the agent-facing response, built from the upstream response.
pub fn build_agent_response_headers(upstream_headers: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream_headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCAN_ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn request_headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn test_ongarde_key_header_stripped() {
        let headers = build_upstream_headers(
            &request_headers(&[("x-ongarde-key", "ong-secret"), ("content-type", "application/json")]),
            SCAN_ID,
        );
        assert!(headers.get("x-ongarde-key").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_ongarde_bearer_stripped_provider_bearer_forwarded() {
        let ongarde = build_upstream_headers(
            &request_headers(&[("authorization", "Bearer ong-secret")]),
            SCAN_ID,
        );
        assert!(ongarde.get("authorization").is_none());

        let provider = build_upstream_headers(
            &request_headers(&[("authorization", "Bearer sk-provider-123")]),
            SCAN_ID,
        );
        assert_eq!(
            provider.get("authorization").unwrap(),
            "Bearer sk-provider-123"
        );
    }

    #[test]
    fn test_hop_by_hop_stripped() {
        let headers = build_upstream_headers(
            &request_headers(&[
                ("connection", "keep-alive"),
                ("transfer-encoding", "chunked"),
                ("host", "proxy.local"),
                ("content-length", "42"),
                ("te", "trailers"),
                ("upgrade", "h2c"),
                ("user-agent", "agent/1.0"),
            ]),
            SCAN_ID,
        );
        for name in HOP_BY_HOP_HEADERS {
            assert!(headers.get(name).is_none(), "{name} should be stripped");
        }
        assert_eq!(headers.get("user-agent").unwrap(), "agent/1.0");
    }

    #[test]
    fn test_scan_id_injected() {
        let headers = build_upstream_headers(&HeaderMap::new(), SCAN_ID);
        assert_eq!(headers.get(SCAN_ID_HEADER).unwrap(), SCAN_ID);
    }

    #[test]
    fn test_provider_specific_headers_forwarded() {
        let headers = build_upstream_headers(
            &request_headers(&[
                ("anthropic-version", "2023-06-01"),
                ("x-api-key", "sk-ant-something"),
                ("openai-organization", "org-1"),
            ]),
            SCAN_ID,
        );
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-something");
        assert_eq!(headers.get("openai-organization").unwrap(), "org-1");
    }

    #[test]
    fn test_response_rate_limit_headers_pass_through() {
        let headers = build_agent_response_headers(&request_headers(&[
            ("x-ratelimit-remaining-requests", "99"),
            ("x-ratelimit-limit-tokens", "40000"),
            ("retry-after", "12"),
            ("content-type", "application/json"),
            ("transfer-encoding", "chunked"),
            ("connection", "close"),
        ]));
        assert_eq!(headers.get("x-ratelimit-remaining-requests").unwrap(), "99");
        assert_eq!(headers.get("x-ratelimit-limit-tokens").unwrap(), "40000");
        assert_eq!(headers.get("retry-after").unwrap(), "12");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("connection").is_none());
    }
}
