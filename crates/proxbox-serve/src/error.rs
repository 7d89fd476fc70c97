//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use proxbox_engine::{IorError, ResolveError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// API error with HTTP status and message
#[derive(Debug, Clone, Serialize, Error)]
#[error("[{status}] {message}")]
pub struct ApiError {
    /// HTTP status code
    #[serde(skip)]
    pub status: StatusCode,

    /// Error message
    pub message: String,

    /// Optional error code for programmatic handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ApiError {
    /// Create a new API error
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
        }
    }

    /// Create an error with a specific error code
    pub fn with_code(status: StatusCode, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// Rejected configuration
    pub fn config(message: impl Into<String>) -> Self {
        Self::with_code(StatusCode::BAD_REQUEST, message, "CONFIG_ERROR")
    }

    /// Unexpected server-side failure
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_code(StatusCode::INTERNAL_SERVER_ERROR, message, "INTERNAL_ERROR")
    }

    /// NetBox rejected or failed a call
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::with_code(StatusCode::BAD_GATEWAY, message, "UPSTREAM_ERROR")
    }

    /// NetBox did not answer in time
    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::with_code(StatusCode::GATEWAY_TIMEOUT, message, "UPSTREAM_TIMEOUT")
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        if err.is_timeout() {
            ApiError::upstream_timeout(err.to_string())
        } else {
            ApiError::upstream(err.to_string())
        }
    }
}

impl From<IorError> for ApiError {
    fn from(err: IorError) -> Self {
        match err {
            IorError::Timeout(_) => ApiError::upstream_timeout(err.to_string()),
            err => ApiError::upstream(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "success": false,
            "error": self.message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (self.status, Json(body)).into_response()
    }
}
