//! Gateway error types with HTTP status code mapping.
//!
//! [`GatewayError`] is the JSON-bodied error for HTTP routes. Each variant
//! maps to a specific HTTP status code and structured JSON error response.
//! [`AdmissionError`] is the typed rejection produced by stream admission;
//! on the stream endpoint it is rendered as an SSE error frame.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::Frame;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2003,
///     "message": "rate limit exceeded; retry after 1 s",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (see code ranges on [`GatewayError`]).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Why a stream client was not admitted. The registry is untouched in
/// both cases.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// The auth gate rejected the token.
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// The registry is at its configured maximum.
    #[error("client capacity of {max} reached")]
    CapacityExceeded {
        /// Configured maximum concurrent clients.
        max: usize,
    },
}

impl AdmissionError {
    /// Returns the HTTP status code for this rejection.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AdmissionError {
    /// Renders the rejection as a single SSE error frame so stream clients
    /// can parse it with the same reader as regular frames.
    fn into_response(self) -> Response {
        let frame = Frame::error(&self.to_string());
        let body = format!("data: {frame}\n\n");
        let mut response = (self.status_code(), body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        response
    }
}

/// JSON-bodied error for non-stream routes.
///
/// # Error Codes
///
/// | Code | Category                  | HTTP Status              |
/// |------|---------------------------|--------------------------|
/// | 2003 | Admission: rate limited   | 429 Too Many Requests    |
///
/// Auth and capacity rejections are [`AdmissionError`], which answers in
/// the stream's own framing.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Client exceeded rate limit.
    #[error("rate limit exceeded; retry after {retry_after_secs} s")]
    RateLimited {
        /// Seconds until the client may retry.
        retry_after_secs: u64,
    },
}

impl GatewayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::RateLimited { .. } => 2003,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let Self::RateLimited { retry_after_secs } = self;
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        response
    }
}
