use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracker_core::wire::{codes, ErrorBody};

/// Request failures. Each maps to a stable code in the JSON body so agents
/// can branch on it without parsing messages.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("timestamp outside the accepted window")]
    TimestampInvalid,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("bearer token missing or malformed")]
    TokenInvalid,
    #[error("bearer token expired")]
    TokenExpired,
    #[error("bearer token revoked")]
    TokenRevoked,
    #[error("unknown client")]
    UnknownClient,
    #[error("client secret required for registration")]
    ClientSecretRequired,
    #[error("device revoked")]
    DeviceRevoked,
    #[error("client id does not match token subject")]
    ClientMismatch,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::TimestampInvalid
            | Self::SignatureInvalid
            | Self::TokenInvalid
            | Self::TokenExpired
            | Self::TokenRevoked
            | Self::UnknownClient => StatusCode::UNAUTHORIZED,
            Self::ClientSecretRequired | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::DeviceRevoked | Self::ClientMismatch => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::TimestampInvalid => codes::TIMESTAMP_INVALID,
            Self::SignatureInvalid => codes::SIGNATURE_INVALID,
            Self::TokenInvalid => codes::TOKEN_INVALID,
            Self::TokenExpired => codes::TOKEN_EXPIRED,
            Self::TokenRevoked => codes::TOKEN_REVOKED,
            Self::UnknownClient => codes::UNKNOWN_CLIENT,
            Self::ClientSecretRequired => codes::CLIENT_SECRET_REQUIRED,
            Self::DeviceRevoked => codes::DEVICE_REVOKED,
            Self::ClientMismatch => codes::CLIENT_MISMATCH,
            Self::BadRequest(_) => codes::BAD_REQUEST,
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            // never echo internal details
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: self.code().to_string(),
            message,
        };
        (self.status_code(), Json(body)).into_response()
    }
}
