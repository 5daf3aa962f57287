//! Signal Service error types.
//!
//! All errors map to HTTP status codes via the `IntoResponse` impl.
//! Storage and internal failures are logged server-side and returned to
//! clients as a generic message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use signal_protocol::ProtocolError;
use thiserror::Error;

/// Signal Service error type.
///
/// Maps to HTTP status codes:
/// - `AuthRequired`: 401 Unauthorized
/// - `NotActiveMember`: 403 Forbidden
/// - `InvalidSignalPayload`, `SelfAddressedSignal`, `InvalidRequest`: 400 Bad Request
/// - `Redis`, `Config`, `Internal`: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum SignalError {
    /// Caller identity is missing or malformed.
    #[error("Authentication required")]
    AuthRequired,

    /// Caller is not a live member of the room.
    #[error("Not an active member of room {0}")]
    NotActiveMember(String),

    /// Offer/answer/candidate body is malformed.
    #[error("Invalid signal payload: {0}")]
    InvalidSignalPayload(String),

    /// Caller addressed a signal to itself.
    #[error("Signal addressed to sender")]
    SelfAddressedSignal,

    /// Path or query parameter is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalError {
    /// Stable machine-readable code, also used as the rejection metric label.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SignalError::AuthRequired => "AUTH_REQUIRED",
            SignalError::NotActiveMember(_) => "NOT_ACTIVE_MEMBER",
            SignalError::InvalidSignalPayload(_) => "INVALID_SIGNAL_PAYLOAD",
            SignalError::SelfAddressedSignal => "SELF_ADDRESSED_SIGNAL",
            SignalError::InvalidRequest(_) => "INVALID_REQUEST",
            SignalError::Redis(_) | SignalError::Config(_) | SignalError::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            SignalError::AuthRequired => StatusCode::UNAUTHORIZED,
            SignalError::NotActiveMember(_) => StatusCode::FORBIDDEN,
            SignalError::InvalidSignalPayload(_)
            | SignalError::SelfAddressedSignal
            | SignalError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SignalError::Redis(_) | SignalError::Config(_) | SignalError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalError::Redis(_) | SignalError::Config(_) | SignalError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            SignalError::NotActiveMember(_) => "Not an active member of this room".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<ProtocolError> for SignalError {
    fn from(err: ProtocolError) -> Self {
        SignalError::InvalidSignalPayload(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for SignalError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(target: "signal.http", error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.client_message(),
            },
        };

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) = "PeerId realm=\"tabletop-mesh\"".parse() {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}
