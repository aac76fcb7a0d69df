//! API error type and HTTP response mapping.
//!
//! Status policy: 200 success; 400 validation and checksum failures;
//! 307 "temporary, retry" for locked, absent, and RPC-push failures;
//! 500 for the unexpected. Bodies carry
//! `{"error_details": {"error_code", "error_message"}}` with the code
//! being the HTTP status as a string.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// JSON error body served to clients.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    /// Wrapped error details.
    pub error_details: ErrorDetails,
}

/// The error payload.
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    /// HTTP status as a string.
    pub error_code: String,
    /// Human-readable message.
    pub error_message: String,
}

/// HTTP API error.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// 400 for malformed requests and checksum mismatches.
    pub fn bad_request(message: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    /// 307 for conditions the caller should retry: contended locks,
    /// missing servables, failed pushes.
    pub fn temporary(message: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::TEMPORARY_REDIRECT,
            message: message.to_string(),
        }
    }

    /// 500 for unexpected failures.
    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error_details: ErrorDetails {
                error_code: self.status.as_u16().to_string(),
                error_message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_status_as_string_code() {
        let error = ApiError::temporary("the key is already locked");
        assert_eq!(error.status(), StatusCode::TEMPORARY_REDIRECT);

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    }

    #[test]
    fn constructors_pick_statuses() {
        assert_eq!(
            ApiError::bad_request("x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::internal("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
