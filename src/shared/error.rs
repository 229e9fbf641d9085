//! Application Error Types
//!
//! Centralized error handling with Axum integration, plus the stable error
//! codes surfaced to WebSocket clients.

use std::fmt;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many requests, retry after {retry_after_secs}s")]
    TooManyRequests { retry_after_secs: u64 },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::domain::StoreError),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, 10001, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, 10002, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, 10003, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, 10004, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, 10005, msg.clone()),
            AppError::TooManyRequests { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                10006,
                "Too many requests, please slow down".into(),
            ),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, 10000, "Internal server error".into())
            }
            AppError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, 10000, "Internal server error".into())
            }
        };

        let retry_after = match &self {
            AppError::TooManyRequests { retry_after_secs } => Some((*retry_after_secs).max(1)),
            _ => None,
        };

        let body = ErrorResponse {
            code,
            message,
            retry_after,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        response
    }
}

// ============================================================================
// Client-visible chat errors
// ============================================================================

/// Broad class of a chat error, used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Authorization,
    Conflict,
    ResourceExhaustion,
    Upstream,
}

/// Stable error codes sent to WebSocket clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidFormat,
    MissingField,
    UnknownMessageType,
    Unauthorized,
    Forbidden,
    SessionNotFound,
    Conflict,
    TooManyRequests,
    LlmUnavailable,
    LlmTimeout,
    StorageError,
    ServiceError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::MissingField => "MISSING_FIELD",
            Self::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::TooManyRequests => "TOO_MANY_REQUESTS",
            Self::LlmUnavailable => "LLM_UNAVAILABLE",
            Self::LlmTimeout => "LLM_TIMEOUT",
            Self::StorageError => "STORAGE_ERROR",
            Self::ServiceError => "SERVICE_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidFormat | Self::MissingField | Self::UnknownMessageType => {
                ErrorCategory::Validation
            }
            Self::Unauthorized | Self::Forbidden | Self::SessionNotFound => {
                ErrorCategory::Authorization
            }
            Self::Conflict => ErrorCategory::Conflict,
            Self::TooManyRequests => ErrorCategory::ResourceExhaustion,
            Self::LlmUnavailable | Self::LlmTimeout | Self::StorageError | Self::ServiceError => {
                ErrorCategory::Upstream
            }
        }
    }

    /// Generic message shown to clients. Never includes upstream detail.
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "Invalid message format",
            Self::MissingField => "Required field is missing",
            Self::UnknownMessageType => "Unknown message type",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::SessionNotFound => "Session not found",
            Self::Conflict => "Session is already being assisted by another administrator",
            Self::TooManyRequests => "Too many requests, please slow down",
            Self::LlmUnavailable => "AI service is temporarily unavailable",
            Self::LlmTimeout => "AI service took too long to respond",
            Self::StorageError => "Failed to save data",
            Self::ServiceError => "Internal service error",
        }
    }

    /// Whether the client may retry the same action on this connection.
    pub fn recoverable(&self) -> bool {
        !matches!(self, Self::Unauthorized | Self::Forbidden)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error object embedded in outbound `error` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    /// Whole seconds, never zero when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// An error destined for a chat client.
///
/// The client only ever sees `code` and the generic `message`; any upstream
/// cause stays server side in `source` and is logged by the caller.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ChatError {
    pub code: ErrorCode,
    pub message: String,
    pub retry_after: Option<u64>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ChatError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            retry_after: None,
            source: None,
        }
    }

    /// Validation error with a client-facing detail such as a field name.
    pub fn validation(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            message: detail.into(),
            ..Self::new(code)
        }
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            retry_after: Some(retry_after_secs.max(1)),
            ..Self::new(ErrorCode::TooManyRequests)
        }
    }

    pub fn upstream(
        code: ErrorCode,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::new(code)
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code.as_str().to_string(),
            message: self.message.clone(),
            recoverable: self.code.recoverable(),
            retry_after: self.retry_after,
        }
    }
}

impl From<ErrorCode> for ChatError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}
