//! Centralized error types for the hearthamp-core library.
//!
//! This module provides a unified error handling system that:
//! - Defines a single application-wide error enum using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Sub-module error types (hardware bus, config store) implement this so
/// their `From` conversion into [`HearthampError`] can reuse the code.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the daemon.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum HearthampError {
    /// Requested entity id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Request conflicts with current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Caller is not authorized to perform the request.
    ///
    /// Never raised by the core itself; reserved for an auth collaborator
    /// sitting in front of the HTTP surface.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Hardware, persistence, or subprocess failure with no better category.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HearthampError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "CONFLICT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type HearthampResult<T> = Result<T, HearthampError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    field: Option<String>,
}

impl IntoResponse for HearthampError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            field: None,
        };
        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for HearthampError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for HearthampError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = HearthampError::NotFound("zone 99".into());
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn bad_request_maps_to_400() {
        let err = HearthampError::BadRequest("vol out of range".into());
        assert_eq!(err.code(), "BAD_REQUEST");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn internal_maps_to_500() {
        let err = HearthampError::Internal("bus timeout".into());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
