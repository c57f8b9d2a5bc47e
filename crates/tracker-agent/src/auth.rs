//! Bearer-token lifecycle for the device.
//!
//! ```text
//! NoToken -> Authenticating -> Authenticated -> (Expired | Revoked) -> Authenticating
//!                 \-> Offline (after exhausting retries or on bad credentials)
//! ```
//!
//! `Offline` is only left through a forced login, which the resyncer issues
//! on its probe interval.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};
use tracker_core::signer::sign_challenge;
use tracker_core::wire::{AuthRequest, AuthResponse};
use tracker_core::Credential;

use crate::api_client::ApiClient;
use crate::backoff::BackoffPolicy;
use crate::config::AgentConfig;
use crate::error::UploadError;

/// Upper bound on a server-provided lifetime.
const MAX_TOKEN_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    NoToken,
    Authenticating,
    Authenticated,
    Expired,
    Revoked,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureMode {
    Normal,
    /// Attempt a login even while offline.
    ForceRetry,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    fn from_response(res: AuthResponse, now: DateTime<Utc>) -> Self {
        let ttl = res.expires_in.min(MAX_TOKEN_TTL_SECS) as i64;
        Self {
            value: res.token,
            issued_at: now,
            expires_at: now + ChronoDuration::seconds(ttl),
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.value.is_empty() && now < self.expires_at
    }
}

struct Session {
    token: Option<Token>,
    state: AuthState,
}

pub struct TokenAuthenticator {
    client: ApiClient,
    credential: Credential,
    credential_path: Option<PathBuf>,
    device_type: String,
    device_name: String,
    backoff: BackoffPolicy,
    registered: AtomicBool,
    offline: AtomicBool,
    session: Mutex<Session>,
    login_lock: tokio::sync::Mutex<()>,
    logins: AtomicU64,
}

impl TokenAuthenticator {
    pub fn new(
        client: ApiClient,
        config: &AgentConfig,
        credential: Credential,
        credential_path: Option<PathBuf>,
    ) -> Self {
        Self {
            registered: AtomicBool::new(credential.registered),
            client,
            credential,
            credential_path,
            device_type: config.device_type.clone(),
            device_name: config.device_name.clone(),
            backoff: config.backoff.clone(),
            offline: AtomicBool::new(false),
            session: Mutex::new(Session {
                token: None,
                state: AuthState::NoToken,
            }),
            login_lock: tokio::sync::Mutex::new(()),
            logins: AtomicU64::new(0),
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        let mut session = self.session.lock();
        if offline {
            session.token = None;
            session.state = AuthState::Offline;
        } else if session.state == AuthState::Offline {
            session.state = AuthState::NoToken;
        }
    }

    pub fn state(&self) -> AuthState {
        self.session.lock().state
    }

    pub fn token_valid(&self) -> bool {
        self.cached(Utc::now()).is_some()
    }

    /// Successful logins since construction.
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }

    fn cached(&self, now: DateTime<Utc>) -> Option<String> {
        let mut session = self.session.lock();
        match &session.token {
            Some(token) if token.is_live(now) => Some(token.value.clone()),
            Some(_) => {
                session.token = None;
                session.state = AuthState::Expired;
                None
            }
            None => None,
        }
    }

    /// Drop the cached token after the collector refused it. A token that has
    /// already been replaced by a newer login is left alone.
    pub fn invalidate(&self, token: &str) {
        let mut session = self.session.lock();
        if session.token.as_ref().map(|t| t.value.as_str()) == Some(token) {
            session.token = None;
            session.state = AuthState::Revoked;
            debug!("bearer token invalidated");
        }
    }

    pub async fn ensure_token(&self, mode: EnsureMode) -> Result<String, UploadError> {
        if let Some(token) = self.cached(Utc::now()) {
            return Ok(token);
        }
        if self.is_offline() && mode == EnsureMode::Normal {
            return Err(UploadError::Offline);
        }

        let _login = self.login_lock.lock().await;
        // another task may have logged in while we waited
        if let Some(token) = self.cached(Utc::now()) {
            return Ok(token);
        }
        if self.is_offline() && mode == EnsureMode::Normal {
            return Err(UploadError::Offline);
        }
        self.session.lock().state = AuthState::Authenticating;

        let mut attempt = 0;
        loop {
            match self.login_once().await {
                Ok(res) => {
                    let token = Token::from_response(res, Utc::now());
                    let value = token.value.clone();
                    {
                        let mut session = self.session.lock();
                        session.token = Some(token);
                        session.state = AuthState::Authenticated;
                    }
                    if self.offline.swap(false, Ordering::SeqCst) {
                        info!("authentication restored, leaving offline mode");
                    }
                    self.logins.fetch_add(1, Ordering::SeqCst);
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => {
                    warn!(error = %err, "authentication failed, not retrying");
                    self.enter_offline();
                    return Err(err);
                }
                Err(err) if attempt >= self.backoff.max_retries => {
                    warn!(error = %err, attempts = attempt + 1, "authentication retries exhausted, switching to offline mode");
                    self.enter_offline();
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.backoff.delay(attempt);
                    debug!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "authentication attempt failed");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn enter_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
        let mut session = self.session.lock();
        session.token = None;
        session.state = AuthState::Offline;
    }

    async fn login_once(&self) -> Result<AuthResponse, UploadError> {
        let mut req = self.build_request()?;
        match self.client.request_token(&req).await {
            Err(UploadError::RegistrationRequired) => {
                if self.registered.load(Ordering::SeqCst) {
                    warn!(client_id = %self.credential.client_id, "collector no longer knows this device, registering again");
                }
                req.client_secret = Some(self.credential.secret_hex().to_string());
                let res = self.client.request_token(&req).await?;
                self.note_registered();
                Ok(res)
            }
            other => other,
        }
    }

    fn build_request(&self) -> Result<AuthRequest, UploadError> {
        let timestamp = Utc::now().timestamp();
        let mut nonce_bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);
        let signature = sign_challenge(
            self.credential.secret(),
            &self.credential.client_id,
            timestamp,
            Some(&nonce),
        )?;
        Ok(AuthRequest {
            client_id: self.credential.client_id.clone(),
            client_secret: None,
            timestamp,
            signature,
            nonce: Some(nonce),
            device_type: self.device_type.clone(),
            device_name: self.device_name.clone(),
        })
    }

    fn note_registered(&self) {
        if self.registered.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(client_id = %self.credential.client_id, "device registered with collector");
        if let Some(path) = &self.credential_path {
            let mut credential = self.credential.clone();
            if let Err(err) = credential.mark_registered(path) {
                warn!(error = %err, "failed to persist registration flag");
            }
        }
    }
}
