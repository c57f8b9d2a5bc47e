//! HMAC-SHA256 request signing.
//!
//! Two message shapes are signed: the login challenge
//! `{client_id}:{timestamp}[:{nonce}]` and the canonical JSON of an upload
//! envelope. Canonical JSON sorts object keys at every depth and uses no
//! insignificant whitespace, so the signer and the verifier always hash the
//! same bytes no matter how either side built its maps.

use crate::error::{CoreError, CoreResult};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &[u8]) -> CoreResult<HmacSha256> {
    HmacSha256::new_from_slice(secret).map_err(|e| CoreError::KeyMaterial(format!("mac init: {e}")))
}

/// Hex HMAC-SHA256 of `message` under `secret`.
pub fn sign(secret: &[u8], message: &[u8]) -> CoreResult<String> {
    let mut mac = mac(secret)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature. Malformed hex is a mismatch.
pub fn verify(secret: &[u8], message: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    match mac(secret) {
        Ok(mut mac) => {
            mac.update(message);
            mac.verify_slice(&expected).is_ok()
        }
        Err(_) => false,
    }
}

pub fn auth_challenge(client_id: &str, timestamp: i64, nonce: Option<&str>) -> String {
    match nonce {
        Some(nonce) if !nonce.is_empty() => format!("{client_id}:{timestamp}:{nonce}"),
        _ => format!("{client_id}:{timestamp}"),
    }
}

pub fn sign_challenge(
    secret: &[u8],
    client_id: &str,
    timestamp: i64,
    nonce: Option<&str>,
) -> CoreResult<String> {
    sign(secret, auth_challenge(client_id, timestamp, nonce).as_bytes())
}

pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn canonical_bytes<T: Serialize>(body: &T) -> CoreResult<Vec<u8>> {
    let value = serde_json::to_value(body)?;
    Ok(canonical_json(&value).into_bytes())
}

pub fn sign_body<T: Serialize>(secret: &[u8], body: &T) -> CoreResult<String> {
    sign(secret, &canonical_bytes(body)?)
}

pub fn verify_body(secret: &[u8], body: &Value, signature_hex: &str) -> bool {
    verify(secret, canonical_json(body).as_bytes(), signature_hex)
}
