//! HTTP response helper functions for consistent API responses.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

/// Standard API success response with JSON data.
pub fn api_success<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, Json(data))
}

/// Success response with a specific status code (used for 201 Created).
pub fn api_success_with_status<T: Serialize>(status: StatusCode, data: T) -> impl IntoResponse {
    (status, Json(data))
}
