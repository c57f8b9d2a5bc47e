use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;
use tracker_core::sealing::{payload_digest, INTEGRITY_FIELD};
use tracker_core::signer::{self, auth_challenge};
use tracker_core::wire::{
    AuthRequest, AuthResponse, UploadAck, UploadEnvelope, AUTH_PATH, HEADER_CLIENT_ID,
    HEADER_SIGNATURE, HEALTH_PATH, UPLOAD_PATH,
};

use crate::audit::Severity;
use crate::error::ApiError;
use crate::records::StoredMetric;
use crate::registry::DeviceStatus;
use crate::state::{AppState, Counters};
use crate::validation::{bearer_token, check_timestamp, required_header};

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(healthcheck))
        .route(AUTH_PATH, post(issue_token))
        .route(UPLOAD_PATH, post(upload_metrics))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

impl AppState {
    fn reject(&self, event: &str, client_id: Option<&str>, err: ApiError) -> ApiError {
        Counters::bump(&self.inner.counters.rejections);
        self.inner.audit.record(
            event,
            Severity::Warning,
            client_id,
            json!({ "reason": err.code() }),
        );
        err
    }
}

/// Device login. Unknown ids are registered on first use when they present
/// a secret and a signature made with it.
pub async fn issue_token(
    State(state): State<AppState>,
    Json(req): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let now = Utc::now();
    let inner = &state.inner;
    let client_id = req.client_id.trim();
    if client_id.is_empty() {
        return Err(ApiError::BadRequest("client_id is required".into()));
    }

    if let Err(err) = check_timestamp(req.timestamp, now, inner.config.timestamp_window_secs) {
        return Err(state.reject("auth_failure", Some(client_id), err));
    }

    let challenge = auth_challenge(client_id, req.timestamp, req.nonce.as_deref());
    let registering = match inner.registry.status(client_id) {
        Some(DeviceStatus::Revoked) => {
            return Err(state.reject("auth_failure", Some(client_id), ApiError::DeviceRevoked));
        }
        Some(DeviceStatus::Active) => {
            let secret = inner.registry.secret(client_id).ok_or(ApiError::UnknownClient)?;
            if !signer::verify(&secret, challenge.as_bytes(), &req.signature) {
                return Err(state.reject("auth_failure", Some(client_id), ApiError::SignatureInvalid));
            }
            None
        }
        None => {
            let Some(secret_hex) = req.client_secret.as_deref() else {
                debug!(client_id, "unknown client without secret, asking for registration");
                return Err(ApiError::ClientSecretRequired);
            };
            let secret = hex::decode(secret_hex)
                .ok()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ApiError::BadRequest("client_secret must be non-empty hex".into()))?;
            if !signer::verify(&secret, challenge.as_bytes(), &req.signature) {
                return Err(state.reject("auth_failure", Some(client_id), ApiError::SignatureInvalid));
            }
            Some(secret)
        }
    };

    if let Some(nonce) = req.nonce.as_deref() {
        let key = format!("{client_id}:{nonce}");
        if !inner.nonces.check_and_store(&key, now, inner.config.timestamp_window_secs) {
            return Err(state.reject("auth_failure", Some(client_id), ApiError::SignatureInvalid));
        }
    }

    if let Some(secret) = registering {
        if inner
            .registry
            .register(client_id, secret, &req.device_type, &req.device_name, now)
        {
            Counters::bump(&inner.counters.registrations);
            inner.audit.record(
                "device_registered",
                Severity::Info,
                Some(client_id),
                json!({ "device_type": req.device_type, "device_name": req.device_name }),
            );
        } else {
            // lost a concurrent first login; the winner's secret is the one on record
            match inner.registry.status(client_id) {
                Some(DeviceStatus::Revoked) => {
                    return Err(state.reject("auth_failure", Some(client_id), ApiError::DeviceRevoked));
                }
                _ => {
                    let matches = inner
                        .registry
                        .secret(client_id)
                        .map(|stored| signer::verify(&stored, challenge.as_bytes(), &req.signature))
                        .unwrap_or(false);
                    if !matches {
                        return Err(state.reject("auth_failure", Some(client_id), ApiError::SignatureInvalid));
                    }
                }
            }
        }
    }

    let (token, claims) = inner.tokens.issue(client_id, now)?;
    inner.registry.touch(client_id, now);
    Counters::bump(&inner.counters.logins);
    inner.audit.record(
        "auth_success",
        Severity::Info,
        Some(client_id),
        json!({ "jti": claims.jti }),
    );

    Ok(Json(AuthResponse {
        token,
        expires_in: inner.tokens.ttl_secs(),
        token_type: "Bearer".to_string(),
    }))
}

/// Signed, token-authorized upload of one sealed payload.
pub async fn upload_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadAck>, ApiError> {
    let now = Utc::now();
    let inner = &state.inner;
    let window = inner.config.timestamp_window_secs;

    let claims = bearer_token(&headers)
        .and_then(|token| inner.tokens.verify(token, now))
        .map_err(|err| state.reject("auth_failure", None, err))?;

    let client_id = required_header(&headers, HEADER_CLIENT_ID)?;
    let signature = required_header(&headers, HEADER_SIGNATURE)?;
    if claims.sub != client_id {
        return Err(state.reject("auth_failure", Some(client_id), ApiError::ClientMismatch));
    }

    let secret = match inner.registry.status(client_id) {
        Some(DeviceStatus::Active) => inner.registry.secret(client_id),
        Some(DeviceStatus::Revoked) => {
            return Err(state.reject("auth_failure", Some(client_id), ApiError::DeviceRevoked));
        }
        None => None,
    }
    .ok_or_else(|| state.reject("signature_failure", Some(client_id), ApiError::UnknownClient))?;

    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid json: {e}")))?;
    let envelope: UploadEnvelope = serde_json::from_value(value.clone())
        .map_err(|e| ApiError::BadRequest(format!("invalid upload: {e}")))?;
    if envelope.client_id != client_id {
        return Err(state.reject("auth_failure", Some(client_id), ApiError::ClientMismatch));
    }

    let sent_at = envelope
        .parsed_timestamp()
        .ok_or_else(|| state.reject("signature_failure", Some(client_id), ApiError::TimestampInvalid))?;
    check_timestamp(sent_at.timestamp(), now, window)
        .map_err(|err| state.reject("signature_failure", Some(client_id), err))?;

    if !signer::verify_body(&secret, &value, signature) {
        return Err(state.reject("signature_failure", Some(client_id), ApiError::SignatureInvalid));
    }

    // a retransmission of a request we already accepted
    if !inner.signatures.check_and_store(signature, now, window) {
        Counters::bump(&inner.counters.duplicates);
        return Ok(Json(UploadAck {
            status: "success".into(),
            duplicate: true,
        }));
    }

    let ciphertext = envelope
        .decode_data()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let digest = payload_digest(&ciphertext);
    let (record, integrity_hash) = match &inner.sealer {
        Some(sealer) => {
            let record = sealer
                .open(&ciphertext)
                .map_err(|e| state.reject("integrity_failure", Some(client_id), ApiError::BadRequest(e.to_string())))?;
            let hash = record
                .get(INTEGRITY_FIELD)
                .and_then(Value::as_str)
                .map(str::to_string);
            (Some(record), hash)
        }
        None => (None, None),
    };

    let data_size = envelope.data.len();
    let stored = inner.records.insert(StoredMetric {
        client_id: client_id.to_string(),
        received_at: now,
        data_type: envelope.data_type,
        digest,
        integrity_hash,
        record,
        ciphertext,
    });
    inner.registry.touch(client_id, now);

    if stored {
        Counters::bump(&inner.counters.uploads);
        inner.audit.record(
            "data_received",
            Severity::Info,
            Some(client_id),
            json!({ "data_size": data_size }),
        );
    } else {
        Counters::bump(&inner.counters.duplicates);
        debug!(client_id, "duplicate payload acknowledged");
    }

    Ok(Json(UploadAck {
        status: "success".into(),
        duplicate: !stored,
    }))
}
