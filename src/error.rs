//! Central error type, mapped to HTTP responses in one place instead of each
//! handler building its own `{"error":...}` body (the pattern the teacher's
//! `routes/sessions.rs` repeats per handler).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum SilcError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("session ended")]
    Gone,
    #[error("unauthorized")]
    Auth,
    #[error("too many sessions")]
    MaxSessions,
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for SilcError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            Self::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            Self::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            Self::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::Gone => (StatusCode::GONE, self.to_string()),
            Self::Auth => (StatusCode::UNAUTHORIZED, self.to_string()),
            Self::MaxSessions => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

pub type SilcResult<T> = Result<T, SilcError>;
