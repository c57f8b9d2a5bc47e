use chrono::Utc;
use std::sync::Arc;
use tracker_core::signer::sign_body;
use tracker_core::wire::UploadEnvelope;

use crate::api_client::ApiClient;
use crate::auth::{EnsureMode, TokenAuthenticator};
use crate::error::UploadError;

/// Builds and posts one signed upload. Shared by the queue worker and the
/// resyncer so both take the exact same path to the collector.
pub struct Courier {
    client: ApiClient,
    auth: Arc<TokenAuthenticator>,
}

impl Courier {
    pub fn new(client: ApiClient, auth: Arc<TokenAuthenticator>) -> Self {
        Self { client, auth }
    }

    pub fn authenticator(&self) -> &Arc<TokenAuthenticator> {
        &self.auth
    }

    /// Single attempt with an already obtained token. A 401 invalidates it.
    pub async fn send_with_token(&self, token: &str, payload: &[u8]) -> Result<(), UploadError> {
        let credential = self.auth.credential();
        let envelope = UploadEnvelope::new(&credential.client_id, payload, Utc::now());
        let signature = sign_body(credential.secret(), &envelope)?;
        let result = self.client.upload(token, &signature, &envelope).await;
        if matches!(result, Err(UploadError::TokenExpired)) {
            self.auth.invalidate(token);
        }
        result
    }

    /// Single attempt including token acquisition.
    pub async fn deliver(&self, payload: &[u8]) -> Result<(), UploadError> {
        let token = self.auth.ensure_token(EnsureMode::Normal).await?;
        self.send_with_token(&token, payload).await
    }
}
