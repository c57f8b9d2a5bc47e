use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid key material: {0}")]
    KeyMaterial(String),
    #[error("seal: {0}")]
    Seal(String),
    #[error("record integrity hash mismatch")]
    IntegrityMismatch,
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("cannot determine data directory")]
    NoDataDir,
}

pub type CoreResult<T> = Result<T, CoreError>;
