use reqwest::{Response, StatusCode};
use std::time::Duration;
use tracker_core::wire::{
    codes, AuthRequest, AuthResponse, ErrorBody, UploadEnvelope, AUTH_PATH, HEADER_CLIENT_ID,
    HEADER_SIGNATURE, HEALTH_PATH, UPLOAD_PATH,
};

use crate::config::AgentConfig;
use crate::error::UploadError;

/// Thin HTTP layer over the collector API. Every call carries its own
/// timeout; nothing here retries.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    auth_timeout: Duration,
    upload_timeout: Duration,
    probe_timeout: Duration,
}

impl ApiClient {
    pub fn new(config: &AgentConfig) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tracker-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            auth_timeout: config.auth_timeout(),
            upload_timeout: config.upload_timeout(),
            probe_timeout: config.probe_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn request_token(&self, req: &AuthRequest) -> Result<AuthResponse, UploadError> {
        let res = self
            .client
            .post(format!("{}{}", self.base_url, AUTH_PATH))
            .header(HEADER_CLIENT_ID, &req.client_id)
            .timeout(self.auth_timeout)
            .json(req)
            .send()
            .await?;
        let status = res.status();
        if status == StatusCode::OK {
            return Ok(res.json::<AuthResponse>().await?);
        }
        let body = error_body(res).await;
        if status.is_server_error() {
            return Err(UploadError::NetworkTransient(format!(
                "auth endpoint returned {status}"
            )));
        }
        if status == StatusCode::BAD_REQUEST && body.error == codes::CLIENT_SECRET_REQUIRED {
            return Err(UploadError::RegistrationRequired);
        }
        Err(UploadError::AuthFailure {
            status: status.as_u16(),
            message: body.error,
        })
    }

    pub async fn upload(
        &self,
        token: &str,
        signature: &str,
        envelope: &UploadEnvelope,
    ) -> Result<(), UploadError> {
        let res = self
            .client
            .post(format!("{}{}", self.base_url, UPLOAD_PATH))
            .bearer_auth(token)
            .header(HEADER_CLIENT_ID, &envelope.client_id)
            .header(HEADER_SIGNATURE, signature)
            .timeout(self.upload_timeout)
            .json(envelope)
            .send()
            .await?;
        let status = res.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        if status.is_server_error() {
            return Err(UploadError::NetworkTransient(format!(
                "upload endpoint returned {status}"
            )));
        }
        let body = error_body(res).await;
        if status == StatusCode::UNAUTHORIZED && is_token_rejection(&body.error) {
            return Err(UploadError::TokenExpired);
        }
        Err(UploadError::Rejected {
            status: status.as_u16(),
            message: body.error,
        })
    }

    /// Connectivity check against the collector health endpoint.
    pub async fn probe(&self) -> Result<(), UploadError> {
        let res = self
            .client
            .get(format!("{}{}", self.base_url, HEALTH_PATH))
            .timeout(self.probe_timeout)
            .send()
            .await?;
        if res.status().is_success() {
            return Ok(());
        }
        Err(UploadError::NetworkTransient(format!(
            "health check returned {}",
            res.status()
        )))
    }
}

/// 401s that a fresh login can cure. An unknown client is among them since
/// logging in again re-registers the device.
fn is_token_rejection(code: &str) -> bool {
    matches!(
        code,
        "" | codes::TOKEN_INVALID
            | codes::TOKEN_EXPIRED
            | codes::TOKEN_REVOKED
            | codes::UNKNOWN_CLIENT
    )
}

async fn error_body(res: Response) -> ErrorBody {
    let text = res.text().await.unwrap_or_default();
    serde_json::from_str(&text).unwrap_or(ErrorBody {
        error: String::new(),
        message: text,
    })
}
