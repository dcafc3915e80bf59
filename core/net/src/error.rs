//! HTTP mapping of [`lanvault_common::Error`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use lanvault_common::Error;

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Stable machine-readable kind, see [`error_code`].
    pub code: String,
}

/// Error returned by request handlers.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// HTTP status for an error.
pub fn status_code(err: &Error) -> StatusCode {
    match err {
        Error::InvalidInput(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
        Error::AuthenticationFailure | Error::Rejected(_) | Error::InvalidSession => {
            StatusCode::UNAUTHORIZED
        }
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        Error::Conflict(_) | Error::Busy(_) | Error::AlreadyExists(_) => StatusCode::CONFLICT,
        Error::Locked => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Machine-readable kind for an error.
pub fn error_code(err: &Error) -> &'static str {
    match err {
        Error::InvalidInput(_) | Error::Serialization(_) => "invalid_input",
        Error::AuthenticationFailure => "authentication_failed",
        Error::Rejected(_) => "rejected",
        Error::InvalidSession => "invalid_session",
        Error::NotFound(_) => "not_found",
        Error::Timeout(_) => "timeout",
        Error::Conflict(_) => "conflict",
        Error::Busy(_) => "busy",
        Error::AlreadyExists(_) => "already_exists",
        Error::Locked => "locked",
        _ => "internal",
    }
}

/// Rebuild an error from a response on the client side.
pub fn from_response(status: StatusCode, body: Option<ErrorBody>) -> Error {
    let (code, message) = match body {
        Some(body) => (body.code, body.error),
        None => (String::new(), status.to_string()),
    };

    match code.as_str() {
        "invalid_input" => Error::InvalidInput(message),
        "authentication_failed" => Error::AuthenticationFailure,
        "rejected" => Error::Rejected(message),
        "invalid_session" => Error::InvalidSession,
        "not_found" => Error::NotFound(message),
        "timeout" => Error::Timeout(message),
        "conflict" => Error::Conflict(message),
        "busy" => Error::Busy(message),
        "already_exists" => Error::AlreadyExists(message),
        "locked" => Error::Locked,
        _ => match status {
            StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => Error::InvalidInput(message),
            StatusCode::UNAUTHORIZED => Error::AuthenticationFailure,
            StatusCode::NOT_FOUND => Error::NotFound(message),
            StatusCode::REQUEST_TIMEOUT => Error::Timeout(message),
            StatusCode::CONFLICT => Error::Conflict(message),
            _ => Error::Io(std::io::Error::other(format!(
                "Unexpected response {}: {}",
                status, message
            ))),
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };

        let body = ErrorBody {
            error: message,
            code: error_code(&self.0).to_string(),
        };
        (status, Json(body)).into_response()
    }
}
