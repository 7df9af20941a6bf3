//! HTTP request handlers for the postline API.
//!
//! Handlers are grouped by functionality:
//! - `webhook` - signed provider webhook intake
//! - `mail` - outbound provider operations for the application
//! - `health` - health, readiness and liveness probes
//! - `metrics` - webhook metrics snapshot
//!
//! # Error Handling
//!
//! Errors are returned as `{"error": {"code": ..., "message": ...}}` with the
//! matching HTTP status. Server-side failures carry a generic message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

pub mod health;
pub mod mail;
pub mod metrics;
pub mod webhook;

pub use health::{health_check, liveness_check, readiness_check};
pub use mail::{calculate_cost, create_letter, get_letter, verify_address};
pub use metrics::webhook_metrics;
pub use webhook::receive_webhook;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Creates a standardized error response.
pub(crate) fn create_error_response(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> Response {
    let error_response =
        ErrorResponse { error: ErrorDetail { code: code.to_string(), message: message.into() } };

    (status, Json(error_response)).into_response()
}
