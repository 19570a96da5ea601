//! API-key authentication.
//!
//! Runs before the scan gate so no scan cycles are spent on unauthenticated
//! traffic. The OnGarde key is accepted either via the `X-OnGarde-Key` header
//! or as `Authorization: Bearer ong-…`; both forms are consumed at the proxy
//! boundary and stripped before the request is forwarded upstream (see
//! `proxy::headers`).

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::errors::AppError;

/// Header carrying the OnGarde API key.
pub const ONGARDE_KEY_HEADER: &str = "x-ongarde-key";

/// Prefix distinguishing an OnGarde key in an Authorization header from an
/// upstream provider key (`Bearer sk-…` passes through untouched).
pub const ONGARDE_BEARER_PREFIX: &str = "Bearer ong-";

/// Authenticate a request against the configured key.
///
/// Returns the user id on success. With no key configured, authentication is
/// disabled (local deployments) and the user id is `"local"`.
pub fn authenticate(headers: &HeaderMap, configured_key: Option<&str>) -> Result<String, AppError> {
    let Some(expected) = configured_key else {
        return Ok("local".to_string());
    };

    let presented = extract_key(headers).ok_or(AppError::Unauthorized)?;
    if constant_time_eq(&presented, expected) {
        Ok("default".to_string())
    } else {
        Err(AppError::Unauthorized)
    }
}

fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(ONGARDE_KEY_HEADER) {
        if let Ok(key) = value.to_str() {
            return Some(key.trim().to_string());
        }
    }
    if let Some(value) = headers.get("authorization") {
        if let Ok(auth) = value.to_str() {
            if auth.starts_with(ONGARDE_BEARER_PREFIX) {
                return Some(auth["Bearer ".len()..].trim().to_string());
            }
        }
    }
    None
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    // Length is leaked by ct_eq on unequal lengths; keys are fixed-format so
    // this reveals nothing an attacker does not already know.
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
