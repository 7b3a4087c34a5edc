use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// 401 with a uniform body; the reason goes to the log, not the wire.
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        AppError::AuthFailed(reason.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::AuthFailed(reason) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "invalid_credentials",
                reason.clone(),
            ),
            AppError::PermissionDenied(reason) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "permission_denied",
                reason.clone(),
            ),
            AppError::RateLimitExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "rate_limit_exceeded",
                "rate limit exceeded".to_string(),
            ),
            AppError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "invalid_request_error",
                "payload_too_large",
                "request body exceeds size limit".to_string(),
            ),
            AppError::Validation(reason) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_request",
                reason.clone(),
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "not_found",
                format!("{} not found", what),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        // Rate-limited callers are told when to come back.
        if matches!(self, AppError::RateLimitExceeded) {
            response.headers_mut().insert(
                "retry-after",
                axum::http::HeaderValue::from_static("60"),
            );
        }

        response
    }
}
