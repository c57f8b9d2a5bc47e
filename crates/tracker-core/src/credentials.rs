use crate::error::{CoreError, CoreResult};
use crate::secure_storage::write_private;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const CLIENT_SECRET_LEN: usize = 32;

/// Device identity shared with the collector. Loaded once at startup.
#[derive(Clone)]
pub struct Credential {
    pub client_id: String,
    client_secret: Zeroizing<Vec<u8>>,
    /// Set once the collector has accepted the secret (trust on first use).
    pub registered: bool,
}

#[derive(Serialize, Deserialize)]
struct CredentialFile {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    registered: bool,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("registered", &self.registered)
            .finish()
    }
}

impl Credential {
    pub fn new(client_id: impl Into<String>, client_secret: Vec<u8>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Zeroizing::new(client_secret),
            registered: false,
        }
    }

    pub fn generate() -> Self {
        let mut secret = vec![0u8; CLIENT_SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self::new(Uuid::new_v4().to_string(), secret)
    }

    pub fn secret(&self) -> &[u8] {
        &self.client_secret
    }

    /// Wire form of the secret, sent only during registration.
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.secret()))
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let raw = Zeroizing::new(std::fs::read_to_string(path)?);
        let file: CredentialFile = serde_json::from_str(&raw)?;
        let secret_hex = Zeroizing::new(file.client_secret);
        let secret = hex::decode(secret_hex.as_str())
            .map_err(|e| CoreError::KeyMaterial(format!("client secret: {e}")))?;
        if file.client_id.trim().is_empty() || secret.is_empty() {
            return Err(CoreError::KeyMaterial("empty credential".into()));
        }
        Ok(Self {
            client_id: file.client_id,
            client_secret: Zeroizing::new(secret),
            registered: file.registered,
        })
    }

    pub fn load_or_create(path: &Path) -> CoreResult<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let credential = Self::generate();
        credential.save(path)?;
        info!(client_id = %credential.client_id, path = %path.display(), "created device credential");
        Ok(credential)
    }

    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let file = CredentialFile {
            client_id: self.client_id.clone(),
            client_secret: self.secret_hex().to_string(),
            registered: self.registered,
        };
        let json = Zeroizing::new(serde_json::to_vec_pretty(&file)?);
        write_private(path, &json)?;
        Ok(())
    }

    pub fn mark_registered(&mut self, path: &Path) -> CoreResult<()> {
        self.registered = true;
        self.save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_or_create_is_stable_across_runs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let first = Credential::load_or_create(&path).unwrap();
        let second = Credential::load_or_create(&path).unwrap();
        assert_eq!(first.client_id, second.client_id);
        assert_eq!(first.secret(), second.secret());
        assert_eq!(first.secret().len(), CLIENT_SECRET_LEN);
        assert!(!second.registered);
    }

    #[test]
    fn registration_flag_is_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let mut cred = Credential::load_or_create(&path).unwrap();
        cred.mark_registered(&path).unwrap();
        assert!(Credential::load(&path).unwrap().registered);
    }

    #[test]
    fn debug_output_hides_the_secret() {
        let cred = Credential::new("dev", vec![0xAB; 4]);
        let shown = format!("{cred:?}");
        assert!(!shown.contains("abababab"));
        assert!(shown.contains("redacted"));
    }

    #[test]
    fn corrupt_secret_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"client_id":"dev","client_secret":"zz"}"#).unwrap();
        assert!(matches!(
            Credential::load(&path),
            Err(CoreError::KeyMaterial(_))
        ));
    }
}
