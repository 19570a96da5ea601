//! Request body size limit middleware.
//!
//! Enforces the 1 MB request body cap before the scan gate or any upstream
//! contact. Two-phase check:
//!
//!   1. Content-Length fast path: reject oversized declarations without
//!      reading a single body byte. A non-numeric Content-Length is a 400.
//!   2. No Content-Length (chunked transfer): accumulate chunks with a
//!      rolling cap and reject as soon as the limit is crossed.
//!
//! Within-limit bodies are buffered here and handed to the proxy handler,
//! which therefore always sees a complete body.

use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;

use crate::constants::MAX_REQUEST_BODY_BYTES;
use crate::errors::AppError;

pub async fn body_size_limit(request: Request, next: Next) -> Response {
    // ── Phase 1: Content-Length fast path ─────────────────────
    if let Some(declared) = request.headers().get("content-length") {
        let declared_size: usize = match declared.to_str().ok().and_then(|v| v.parse().ok()) {
            Some(size) => size,
            None => {
                tracing::warn!(value = ?declared, "invalid Content-Length header");
                return AppError::InvalidContentLength.into_response();
            }
        };
        if declared_size > MAX_REQUEST_BODY_BYTES {
            tracing::warn!(
                declared_size,
                limit = MAX_REQUEST_BODY_BYTES,
                path = %request.uri().path(),
                "request body too large (Content-Length)"
            );
            return AppError::PayloadTooLarge.into_response();
        }
        return next.run(request).await;
    }

    // ── Phase 2: chunked — rolling cap ────────────────────────
    let (parts, body) = request.into_parts();
    let mut stream = body.into_data_stream();
    let mut buffered: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "request body read failed");
                return AppError::Internal(anyhow::anyhow!("body read failed: {e}"))
                    .into_response();
            }
        };
        if buffered.len() + chunk.len() > MAX_REQUEST_BODY_BYTES {
            tracing::warn!(
                accumulated = buffered.len() + chunk.len(),
                limit = MAX_REQUEST_BODY_BYTES,
                path = %parts.uri.path(),
                "request body too large (chunked)"
            );
            return AppError::PayloadTooLarge.into_response();
        }
        buffered.extend_from_slice(&chunk);
    }

    let request = Request::from_parts(parts, Body::from(buffered));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/echo", post(|body: Bytes| async move { body.len().to_string() }))
            .layer(axum::middleware::from_fn(body_size_limit))
    }

    fn request(body: Body, content_length: Option<usize>) -> Request {
        let mut builder = Request::builder().method("POST").uri("/echo");
        if let Some(len) = content_length {
            builder = builder.header("content-length", len.to_string());
        }
        builder.body(body).unwrap()
    }

    #[tokio::test]
    async fn test_small_body_passes() {
        let response = app()
            .oneshot(request(Body::from("hello"), Some(5)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_declared_oversize_is_413() {
        let response = app()
            .oneshot(request(Body::empty(), Some(MAX_REQUEST_BODY_BYTES + 1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_boundary_exactly_at_limit_passes() {
        // ≤ 1 MB passes; the limit itself is allowed.
        let body = vec![0u8; MAX_REQUEST_BODY_BYTES];
        let response = app()
            .oneshot(request(Body::from(body), Some(MAX_REQUEST_BODY_BYTES)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_content_length_is_400() {
        let req = Request::builder()
            .method("POST")
            .uri("/echo")
            .header("content-length", "not-a-number")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chunked_oversize_rejected() {
        // No Content-Length header: the rolling cap applies.
        let chunks: Vec<Result<Bytes, std::io::Error>> = (0..5)
            .map(|_| Ok(Bytes::from(vec![0u8; 300 * 1024])))
            .collect();
        let body = Body::from_stream(futures::stream::iter(chunks));
        let response = app().oneshot(request(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_chunked_within_limit_passes() {
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))];
        let body = Body::from_stream(futures::stream::iter(chunks));
        let response = app().oneshot(request(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"11");
    }
}
