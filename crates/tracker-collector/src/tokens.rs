//! Bearer tokens: `base64url(claims) . hex(hmac-sha256(claims part))`.
//!
//! The signing key is random per process, so a collector restart
//! invalidates every outstanding token and agents simply log in again.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracker_core::signer;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::ApiError;

pub const TOKEN_TYPE_DEVICE: &str = "device";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Default)]
struct Revocations {
    /// jti -> exp, pruned once the token would have expired anyway
    tokens: HashMap<String, i64>,
    /// subject -> cutoff; tokens issued at or before it are dead
    subjects: HashMap<String, i64>,
}

pub struct TokenIssuer {
    key: Zeroizing<[u8; 32]>,
    ttl_secs: i64,
    revoked: Mutex<Revocations>,
}

impl TokenIssuer {
    pub fn new(ttl_secs: u64) -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut key[..]);
        Self {
            key,
            ttl_secs: ttl_secs.min(i64::MAX as u64) as i64,
            revoked: Mutex::new(Revocations::default()),
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs as u64
    }

    pub fn issue(&self, subject: &str, now: DateTime<Utc>) -> Result<(String, Claims), ApiError> {
        let iat = now.timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            typ: TOKEN_TYPE_DEVICE.to_string(),
            iat,
            exp: iat.saturating_add(self.ttl_secs),
            jti: Uuid::new_v4().to_string(),
        };
        let json = serde_json::to_vec(&claims).map_err(|e| ApiError::Internal(e.to_string()))?;
        let body = URL_SAFE_NO_PAD.encode(json);
        let mac = signer::sign(&self.key[..], body.as_bytes())
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok((format!("{body}.{mac}"), claims))
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, ApiError> {
        let (body, mac) = token.split_once('.').ok_or(ApiError::TokenInvalid)?;
        if !signer::verify(&self.key[..], body.as_bytes(), mac) {
            return Err(ApiError::TokenInvalid);
        }
        let raw = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| ApiError::TokenInvalid)?;
        let claims: Claims = serde_json::from_slice(&raw).map_err(|_| ApiError::TokenInvalid)?;
        if claims.typ != TOKEN_TYPE_DEVICE {
            return Err(ApiError::TokenInvalid);
        }
        if now.timestamp() >= claims.exp {
            return Err(ApiError::TokenExpired);
        }
        let revoked = self.revoked.lock();
        if revoked.tokens.contains_key(&claims.jti) {
            return Err(ApiError::TokenRevoked);
        }
        if let Some(cutoff) = revoked.subjects.get(&claims.sub) {
            if claims.iat <= *cutoff {
                return Err(ApiError::TokenRevoked);
            }
        }
        Ok(claims)
    }

    pub fn revoke(&self, claims: &Claims) {
        self.revoked
            .lock()
            .tokens
            .insert(claims.jti.clone(), claims.exp);
    }

    /// Revoke every token issued to `subject` up to `now`.
    pub fn revoke_subject(&self, subject: &str, now: DateTime<Utc>) {
        self.revoked
            .lock()
            .subjects
            .insert(subject.to_string(), now.timestamp());
    }

    pub fn prune(&self, now: DateTime<Utc>) {
        let now = now.timestamp();
        self.revoked.lock().tokens.retain(|_, exp| *exp > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn issued_token_verifies_until_expiry() {
        let issuer = TokenIssuer::new(60);
        let now = Utc::now();
        let (token, claims) = issuer.issue("dev-1", now).unwrap();
        assert_eq!(issuer.verify(&token, now).unwrap(), claims);
        assert_eq!(claims.exp - claims.iat, 60);
        assert!(matches!(
            issuer.verify(&token, now + Duration::seconds(60)),
            Err(ApiError::TokenExpired)
        ));
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let issuer = TokenIssuer::new(60);
        let (token, _) = issuer.issue("dev-1", Utc::now()).unwrap();
        let (_, mac) = token.split_once('.').unwrap();
        let forged_claims = URL_SAFE_NO_PAD.encode(
            br#"{"sub":"dev-2","typ":"device","iat":0,"exp":99999999999,"jti":"x"}"#,
        );
        let forged = format!("{forged_claims}.{mac}");
        assert!(matches!(issuer.verify(&forged, Utc::now()), Err(ApiError::TokenInvalid)));
        assert!(matches!(issuer.verify("garbage", Utc::now()), Err(ApiError::TokenInvalid)));
    }

    #[test]
    fn tokens_from_another_process_are_invalid() {
        let (token, _) = TokenIssuer::new(60).issue("dev-1", Utc::now()).unwrap();
        assert!(matches!(
            TokenIssuer::new(60).verify(&token, Utc::now()),
            Err(ApiError::TokenInvalid)
        ));
    }

    #[test]
    fn revocation_by_id_and_by_subject() {
        let issuer = TokenIssuer::new(600);
        let now = Utc::now();
        let (a, claims_a) = issuer.issue("dev-1", now).unwrap();
        let (b, _) = issuer.issue("dev-1", now).unwrap();
        issuer.revoke(&claims_a);
        assert!(matches!(issuer.verify(&a, now), Err(ApiError::TokenRevoked)));
        assert!(issuer.verify(&b, now).is_ok());

        issuer.revoke_subject("dev-1", now);
        assert!(matches!(issuer.verify(&b, now), Err(ApiError::TokenRevoked)));
        let (c, _) = issuer.issue("dev-1", now + Duration::seconds(1)).unwrap();
        assert!(issuer.verify(&c, now + Duration::seconds(1)).is_ok());
    }

    #[test]
    fn prune_drops_expired_revocations() {
        let issuer = TokenIssuer::new(10);
        let now = Utc::now();
        let (_, claims) = issuer.issue("dev-1", now).unwrap();
        issuer.revoke(&claims);
        issuer.prune(now + Duration::seconds(11));
        assert!(issuer.revoked.lock().tokens.is_empty());
    }
}
