//! Centralized error types for the pathmux core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the pathmux server.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum PathmuxError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A path name was used that has no matching configuration entry.
    #[error("path not configured: {0}")]
    PathNotConfigured(String),

    /// Authentication or authorization denied the request.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A publisher tried to attach to a path that already has one and
    /// override is disabled.
    #[error("path already publishing: {0}")]
    AlreadyPublishing(String),

    /// A static source did not become ready before its start timeout.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Returned to a publisher that was evicted by an overriding publisher.
    #[error("session replaced by a new publisher")]
    Replaced,

    /// Returned to any operation on a component that has been cancelled.
    #[error("terminated")]
    Terminated,

    /// Front-end-specific protocol error, opaque to the core.
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

impl ErrorCode for PathmuxError {
    fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::PathNotConfigured(_) => "path_not_configured",
            Self::AuthFailed(_) => "auth_failed",
            Self::AlreadyPublishing(_) => "already_publishing",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::Replaced => "replaced",
            Self::Terminated => "terminated",
            Self::ProtocolError(_) => "protocol_error",
        }
    }
}

impl PathmuxError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        ErrorCode::code(self)
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PathNotConfigured(_) | Self::SourceUnavailable(_) => StatusCode::NOT_FOUND,
            Self::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            Self::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            Self::AlreadyPublishing(_) => StatusCode::CONFLICT,
            Self::Replaced | Self::Terminated => StatusCode::GONE,
            Self::ProtocolError(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Convenient Result alias for engine-wide operations.
pub type PathmuxResult<T> = Result<T, PathmuxError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for PathmuxError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_not_configured_returns_404() {
        let err = PathmuxError::PathNotConfigured("cam1".into());
        assert_eq!(err.code(), "path_not_configured");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn already_publishing_returns_409() {
        let err = PathmuxError::AlreadyPublishing("cam1".into());
        assert_eq!(err.code(), "already_publishing");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn auth_failed_returns_401() {
        let err = PathmuxError::AuthFailed("bad credentials".into());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }
}
