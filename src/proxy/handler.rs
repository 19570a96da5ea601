//! The proxy handler — byte-identical forwarding behind the scan gate.
//!
//! Flow: path guard → authentication → request scan → upstream dispatch →
//! response routing (buffered vs streaming). The failure-mode separation is
//! the central correctness invariant:
//!
//! | condition                    | status | X-OnGarde-Block |
//! |------------------------------|--------|-----------------|
//! | scan gate returns BLOCK      | 400    | `true`          |
//! | upstream unreachable         | 502    | absent          |
//! | upstream returns 4xx/5xx     | passthrough | absent     |
//! | malformed upstream URL       | 500    | absent          |

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

use crate::audit::{self, Direction};
use crate::auth::authenticate;
use crate::config::Config;
use crate::constants::MAX_RESPONSE_BUFFER_BYTES;
use crate::errors::AppError;
use crate::models::block::{
    build_block_response, build_config_error_response, build_upstream_unavailable_response,
};
use crate::models::scan::Action;
use crate::proxy::headers::{build_agent_response_headers, build_upstream_headers};
use crate::proxy::stream_scan::{stream_scan_body, StreamScanContext};
use crate::proxy::upstream::UpstreamError;
use crate::scanner::safe_scan::scan_or_block;
use crate::utils::ulid::generate_ulid;
use crate::AppState;

/// Return the upstream base URL for a request path. `v1/messages` (and
/// sub-paths) route to the Anthropic upstream; every other `v1/*` path goes
/// to the OpenAI-compatible upstream.
fn route_upstream<'a>(path: &str, config: &'a Config) -> &'a str {
    if path == "v1/messages" || path.starts_with("v1/messages/") {
        &config.upstream.anthropic
    } else {
        &config.upstream.openai
    }
}

pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.is_ready() {
        return AppError::NotReady.into_response();
    }

    // ── Path guard: only /v1/* is proxied ─────────────────────
    let path = uri.path().trim_start_matches('/').to_string();
    if !path.starts_with("v1/") && path != "v1" {
        return AppError::NotFound(format!("/{path}")).into_response();
    }

    // ── Authentication — before the scan gate, so unauthenticated
    // traffic never spends scan cycles ────────────────────────
    let user_id = match authenticate(&headers, state.config.auth.api_key.as_deref()) {
        Ok(user_id) => user_id,
        Err(e) => return e.into_response(),
    };

    // Scan id binds at entry and flows through logs, audit and headers.
    let scan_id = generate_ulid();

    let upstream_base = route_upstream(&path, &state.config).trim_end_matches('/');
    let upstream_url = match uri.query() {
        Some(query) => format!("{upstream_base}/{path}?{query}"),
        None => format!("{upstream_base}/{path}"),
    };

    // ── Request scan gate ─────────────────────────────────────
    let content_text = String::from_utf8_lossy(&body);
    let scan_result = scan_or_block(
        &content_text,
        state.entity_scanner(),
        &state.thresholds,
        &scan_id,
        Some(&state.latency),
        Some(&state.allowlist),
    )
    .await;

    audit::emit_request_event(state.audit.as_ref(), &scan_result, &user_id);

    match scan_result.action {
        Action::Block => {
            // Upstream is never contacted for a blocked request.
            tracing::info!(
                %scan_id,
                rule_id = scan_result.rule_id.as_deref().unwrap_or(""),
                risk_level = scan_result.risk_level.map(|r| r.as_str()).unwrap_or(""),
                %path,
                "request blocked"
            );
            return build_block_response(&scan_result);
        }
        Action::AllowSuppressed => {
            tracing::info!(
                %scan_id,
                rule_id = scan_result.rule_id.as_deref().unwrap_or(""),
                allowlist_rule_id = scan_result.allowlist_rule_id.as_deref().unwrap_or(""),
                %path,
                "block suppressed by allowlist"
            );
        }
        Action::Allow => {}
    }

    // ── Dispatch upstream ─────────────────────────────────────
    let upstream_headers = build_upstream_headers(&headers, &scan_id);
    let upstream_response = match state
        .upstream
        .forward(method.clone(), &upstream_url, upstream_headers, body)
        .await
    {
        Ok(response) => response,
        Err(e @ UpstreamError::Unavailable { .. }) => {
            tracing::warn!(%scan_id, %upstream_url, kind = e.kind(), "upstream unavailable");
            return build_upstream_unavailable_response(&scan_id, e.kind());
        }
        Err(UpstreamError::BadUrl(url)) => {
            tracing::error!(%scan_id, %url, "invalid upstream URL (configuration error)");
            return build_config_error_response(&scan_id);
        }
    };

    let status = upstream_response.status();
    let agent_headers = build_agent_response_headers(upstream_response.headers());
    tracing::info!(
        %scan_id,
        %method,
        %path,
        upstream = %upstream_url,
        status = status.as_u16(),
        "request proxied"
    );

    // ── Response routing: streaming vs buffered ───────────────
    let is_sse = upstream_response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);
    let declared_large = upstream_response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .map(|len| len > MAX_RESPONSE_BUFFER_BYTES)
        .unwrap_or(false);

    if is_sse || declared_large {
        let body = stream_scan_body(
            upstream_response,
            StreamScanContext {
                scan_id,
                user_id,
                worker: state.entity_scanner(),
                audit: state.audit.clone(),
                metrics: state.streaming.clone(),
            },
        );
        return build_passthrough_response(status, agent_headers, body);
    }

    // Buffered path: read the whole body, scan once, then forward.
    let response_body = match upstream_response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(%scan_id, error = %e, "upstream body read failed");
            return build_upstream_unavailable_response(&scan_id, "protocol");
        }
    };

    if !response_body.is_empty() {
        let response_text = String::from_utf8_lossy(&response_body);
        let response_scan = scan_or_block(
            &response_text,
            state.entity_scanner(),
            &state.thresholds,
            &scan_id,
            Some(&state.latency),
            Some(&state.allowlist),
        )
        .await;

        if response_scan.action != Action::Allow {
            audit::emit(
                state.audit.as_ref(),
                audit::AuditEvent::from_scan(&response_scan, &user_id, Direction::Response, None),
            );
        }
        if response_scan.action == Action::Block {
            tracing::info!(
                %scan_id,
                rule_id = response_scan.rule_id.as_deref().unwrap_or(""),
                "response body blocked"
            );
            // The upstream body is discarded — the agent sees only the block.
            return build_block_response(&response_scan);
        }
    }

    build_passthrough_response(status, agent_headers, Body::from(response_body))
}

fn build_passthrough_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
