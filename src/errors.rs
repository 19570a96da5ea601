use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid or missing API key")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("invalid content-length header")]
    InvalidContentLength,

    #[error("service starting")]
    NotReady,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, msg) = match &self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "invalid_api_key",
                "invalid or missing OnGarde API key".to_string(),
            ),
            AppError::NotFound(path) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Not found: {}", path),
            ),
            AppError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "Request body too large. Maximum size: 1MB".to_string(),
            ),
            AppError::InvalidContentLength => (
                StatusCode::BAD_REQUEST,
                "bad_request",
                "Invalid Content-Length header".to_string(),
            ),
            AppError::NotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                "starting",
                "OnGarde is starting up. Scanner warming up...".to_string(),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_payload_too_large_body_matches_contract() {
        let response = AppError::PayloadTooLarge.into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body["error"]["message"],
            "Request body too large. Maximum size: 1MB"
        );
        assert_eq!(body["error"]["code"], "payload_too_large");
    }

    #[test]
    fn test_unauthorized_maps_to_401() {
        assert_eq!(
            AppError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_not_found_maps_to_404() {
        assert_eq!(
            AppError::NotFound("/metrics".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
    }
}
