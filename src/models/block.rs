//! BLOCK and upstream-unavailable HTTP response builders.
//!
//! The proxy has two user-visible failure modes that must never be confused:
//!
//! - `build_block_response()` — HTTP 400, security policy BLOCK. Always
//!   carries `X-OnGarde-Block: true` and `X-OnGarde-Scan-ID`.
//! - `build_upstream_unavailable_response()` — HTTP 502, the upstream LLM
//!   provider is unreachable. Carries the scan id for correlation but
//!   **never** `X-OnGarde-Block` — a gateway error is not a security block.
//!
//! The header presence is the sole bit agents use to distinguish "the proxy
//! refused this for safety reasons" from "retry against your usual upstream
//! error policy".

use axum::http::{header::HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::models::scan::ScanResult;

pub const BLOCK_HEADER: &str = "x-ongarde-block";
pub const SCAN_ID_HEADER: &str = "x-ongarde-scan-id";

/// HTTP 400 BLOCK response in OpenAI-compatible error format with the
/// `ongarde` extension object.
pub fn build_block_response(result: &ScanResult) -> Response {
    let body = json!({
        "error": {
            "message": "Request blocked by OnGarde security policy",
            "type": "ongarde_block",
            "code": "policy_violation",
        },
        "ongarde": {
            "blocked": true,
            "rule_id": result.rule_id,
            "risk_level": result.risk_level.map(|r| r.as_str()),
            "scan_id": result.scan_id,
            "redacted_excerpt": result.redacted_excerpt,
            "suppression_hint": result.suppression_hint,
            "test": result.test,
        },
    });

    let mut response = (StatusCode::BAD_REQUEST, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(BLOCK_HEADER, HeaderValue::from_static("true"));
    if let Ok(v) = HeaderValue::from_str(&result.scan_id) {
        headers.insert(SCAN_ID_HEADER, v);
    }
    response
}

/// HTTP 502 response for upstream connectivity failures.
///
/// `reason` is a short error-kind label (e.g. "connect"); it must never
/// contain credential data or internal configuration detail.
pub fn build_upstream_unavailable_response(scan_id: &str, reason: &str) -> Response {
    let body = json!({
        "error": {
            "message": "Upstream LLM provider unavailable",
            "code": "upstream_unavailable",
            "detail": if reason.is_empty() { serde_json::Value::Null } else { json!(reason) },
        }
    });

    let mut response = (StatusCode::BAD_GATEWAY, Json(body)).into_response();
    // Scan id for operator correlation only. X-OnGarde-Block is intentionally
    // absent: a connectivity failure is not a BLOCK.
    if let Ok(v) = HeaderValue::from_str(scan_id) {
        response.headers_mut().insert(SCAN_ID_HEADER, v);
    }
    response
}

/// HTTP 500 response for a malformed upstream URL (operator config error).
pub fn build_config_error_response(scan_id: &str) -> Response {
    let body = json!({
        "error": {
            "message": "Internal configuration error",
            "code": "config_error",
        }
    });
    let mut response = (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
    if let Ok(v) = HeaderValue::from_str(scan_id) {
        response.headers_mut().insert(SCAN_ID_HEADER, v);
    }
    response
}
