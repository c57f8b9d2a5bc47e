//! JSON bodies and header names exchanged between agent and collector.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

pub const AUTH_PATH: &str = "/api/auth/token";
pub const UPLOAD_PATH: &str = "/api/metrics/upload";
pub const HEALTH_PATH: &str = "/health";

pub const HEADER_CLIENT_ID: &str = "X-Client-ID";
pub const HEADER_SIGNATURE: &str = "X-Request-Signature";

pub const DATA_TYPE_PERFORMANCE: &str = "performance_metrics";

/// Maximum tolerated skew between a request timestamp and receipt time.
pub const TIMESTAMP_WINDOW_SECS: i64 = 300;

/// Stable error codes carried in [`ErrorBody::error`].
pub mod codes {
    pub const TIMESTAMP_INVALID: &str = "timestamp_invalid";
    pub const SIGNATURE_INVALID: &str = "signature_invalid";
    pub const TOKEN_INVALID: &str = "token_invalid";
    pub const TOKEN_EXPIRED: &str = "token_expired";
    pub const TOKEN_REVOKED: &str = "token_revoked";
    pub const UNKNOWN_CLIENT: &str = "unknown_client";
    pub const CLIENT_SECRET_REQUIRED: &str = "client_secret_required";
    pub const DEVICE_REVOKED: &str = "device_revoked";
    pub const CLIENT_MISMATCH: &str = "client_mismatch";
    pub const BAD_REQUEST: &str = "bad_request";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthRequest {
    pub client_id: String,
    /// Only present on the one-time registration exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthResponse {
    pub token: String,
    pub expires_in: u64,
    #[serde(default = "bearer")]
    pub token_type: String,
}

fn bearer() -> String {
    "Bearer".to_string()
}

/// Upload body. The `X-Request-Signature` header is the HMAC of the
/// canonical JSON of exactly this object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadEnvelope {
    pub data: String,
    pub timestamp: String,
    pub client_id: String,
    pub data_type: String,
}

impl UploadEnvelope {
    pub fn new(client_id: &str, ciphertext: &[u8], now: DateTime<Utc>) -> Self {
        Self {
            data: general_purpose::STANDARD.encode(ciphertext),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            client_id: client_id.to_string(),
            data_type: DATA_TYPE_PERFORMANCE.to_string(),
        }
    }

    pub fn decode_data(&self) -> CoreResult<Vec<u8>> {
        general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| CoreError::Seal(format!("base64 payload: {e}")))
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadAck {
    pub status: String,
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub message: String,
}
