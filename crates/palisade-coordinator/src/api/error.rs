//! API error responses
//!
//! Maps the core error taxonomy onto HTTP status codes with a JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use palisade_core::CoreError;
use serde::Serialize;

/// Wrapper so core errors can flow out of handlers with `?`
pub struct ApiError(pub CoreError);

/// JSON error body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            CoreError::PermissionDenied(_) => (StatusCode::FORBIDDEN, "PERMISSION_DENIED"),
            CoreError::ResourceExhausted(_) => {
                (StatusCode::TOO_MANY_REQUESTS, "RESOURCE_EXHAUSTED")
            }
            CoreError::FailedPrecondition(_) => {
                (StatusCode::PRECONDITION_FAILED, "FAILED_PRECONDITION")
            }
            CoreError::Invalid(_) => (StatusCode::BAD_REQUEST, "INVALID"),
            CoreError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
            CoreError::Recovering => (StatusCode::SERVICE_UNAVAILABLE, "RECOVERING"),
            CoreError::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, "DEADLINE_EXCEEDED"),
        };

        let body = ErrorResponse {
            error: self.0.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}
