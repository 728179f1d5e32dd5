//! HTTP error types for the `cmdrelay` server.
//!
//! Maps gateway errors from `cmdrelay-core` into HTTP responses. Every error
//! variant produces a JSON body with a machine-readable `error` field and a
//! human-readable `message`.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use cmdrelay_core::error::GatewayError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Missing or wrong API token.
    Unauthorized(String),
    /// No operation with this name.
    UnknownOperation(String),
    /// A parameter failed validation.
    InvalidParameter { parameter: String, message: String },
    /// The body is not a JSON object.
    BadRequest(String),
    /// Every execution slot is busy.
    Overloaded(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameter: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message, parameter) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg, None),
            Self::UnknownOperation(msg) => (StatusCode::NOT_FOUND, "unknown_operation", msg, None),
            Self::InvalidParameter { parameter, message } => (
                StatusCode::BAD_REQUEST,
                "invalid_parameter",
                message,
                Some(parameter),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg, None),
            Self::Overloaded(msg) => (StatusCode::SERVICE_UNAVAILABLE, "overloaded", msg, None),
        };

        let retry = status == StatusCode::SERVICE_UNAVAILABLE;
        let body = ErrorBody {
            error: error_type,
            message,
            parameter,
        };

        let mut response = (status, axum::Json(body)).into_response();
        if retry {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::UnknownOperation { .. } => Self::UnknownOperation(err.to_string()),
            GatewayError::InvalidParameter { ref name, .. } => Self::InvalidParameter {
                parameter: name.clone(),
                message: err.to_string(),
            },
            GatewayError::Overloaded { .. } => Self::Overloaded(err.to_string()),
        }
    }
}
