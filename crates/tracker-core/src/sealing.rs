//! Producer-side record encryption.
//!
//! A record is a JSON object. Sealing stamps it with an `integrity_hash`
//! (SHA-256 of its canonical JSON) and encrypts it with XChaCha20-Poly1305.
//! Sealed layout: 24-byte nonce followed by ciphertext, no header.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;
use zeroize::Zeroizing;

use crate::error::{CoreError, CoreResult};
use crate::secure_storage::write_private;
use crate::signer::canonical_json;

pub const DATA_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const INTEGRITY_FIELD: &str = "integrity_hash";

pub struct RecordSealer {
    key: Zeroizing<[u8; DATA_KEY_LEN]>,
}

impl RecordSealer {
    pub fn new(key: [u8; DATA_KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    pub fn from_hex(encoded: &str) -> CoreResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| CoreError::KeyMaterial(format!("data key: {e}")))?,
        );
        let key: [u8; DATA_KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::KeyMaterial("data key length".into()))?;
        Ok(Self::new(key))
    }

    pub fn generate() -> Self {
        let mut key = [0u8; DATA_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let encoded = Zeroizing::new(std::fs::read_to_string(path)?);
        Self::from_hex(&encoded)
    }

    pub fn load_or_create(path: &Path) -> CoreResult<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let sealer = Self::generate();
        let encoded = Zeroizing::new(hex::encode(sealer.key.as_slice()));
        write_private(path, encoded.as_bytes())?;
        info!(path = %path.display(), "created data encryption key");
        Ok(sealer)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()))
    }

    pub fn seal(&self, record: &Value) -> CoreResult<Vec<u8>> {
        let mut record = record.clone();
        let hash = integrity_hash(&record)?;
        record
            .as_object_mut()
            .ok_or(CoreError::NotAnObject)?
            .insert(INTEGRITY_FIELD.to_string(), Value::String(hash));
        let plaintext = Zeroizing::new(serde_json::to_vec(&record)?);

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| CoreError::Seal(format!("encrypt: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt and re-check the embedded integrity hash.
    pub fn open(&self, sealed: &[u8]) -> CoreResult<Value> {
        if sealed.len() <= NONCE_LEN {
            return Err(CoreError::Seal("sealed record too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.cipher()
                .decrypt(XNonce::from_slice(nonce), ciphertext)
                .map_err(|e| CoreError::Seal(format!("decrypt: {e}")))?,
        );
        let record: Value = serde_json::from_slice(&plaintext)?;
        let claimed = record
            .get(INTEGRITY_FIELD)
            .and_then(Value::as_str)
            .ok_or(CoreError::IntegrityMismatch)?;
        if integrity_hash(&record)? != claimed {
            return Err(CoreError::IntegrityMismatch);
        }
        Ok(record)
    }
}

/// SHA-256 hex of the record's canonical JSON, ignoring any existing
/// `integrity_hash` field.
pub fn integrity_hash(record: &Value) -> CoreResult<String> {
    let mut body = record.as_object().ok_or(CoreError::NotAnObject)?.clone();
    body.remove(INTEGRITY_FIELD);
    let canonical = canonical_json(&Value::Object(body));
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// SHA-256 hex of opaque payload bytes; the collector deduplicates on it.
pub fn payload_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn sealed_record_opens_with_matching_hash() {
        let sealer = RecordSealer::generate();
        let record = json!({"apm": 312, "clicks": 40, "device": "mouse"});
        let sealed = sealer.seal(&record).unwrap();
        let opened = sealer.open(&sealed).unwrap();
        assert_eq!(opened["apm"], 312);
        assert_eq!(
            opened[INTEGRITY_FIELD].as_str().unwrap(),
            integrity_hash(&record).unwrap()
        );
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let sealer = RecordSealer::generate();
        let mut sealed = sealer.seal(&json!({"x": 1})).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(sealer.open(&sealed), Err(CoreError::Seal(_))));
    }

    #[test]
    fn wrong_key_cannot_open() {
        let sealed = RecordSealer::generate().seal(&json!({"x": 1})).unwrap();
        assert!(RecordSealer::generate().open(&sealed).is_err());
    }

    #[test]
    fn non_object_records_are_refused() {
        let sealer = RecordSealer::generate();
        assert!(matches!(sealer.seal(&json!([1, 2])), Err(CoreError::NotAnObject)));
    }

    #[test]
    fn key_file_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("encryption.key");
        let first = RecordSealer::load_or_create(&path).unwrap();
        let sealed = first.seal(&json!({"k": "v"})).unwrap();
        let second = RecordSealer::load_or_create(&path).unwrap();
        assert_eq!(second.open(&sealed).unwrap()["k"], "v");
    }
}
