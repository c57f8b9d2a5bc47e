use thiserror::Error;
use tracker_core::CoreError;

/// Failure taxonomy of the uploader. Nothing here ever reaches the producer;
/// it only steers retry, demotion and offline decisions.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Bad credentials. Retrying cannot help.
    #[error("authentication rejected ({status}): {message}")]
    AuthFailure { status: u16, message: String },
    /// The collector does not know this device and wants the secret.
    #[error("collector requires registration")]
    RegistrationRequired,
    /// Timeout, refused connection or a 5xx.
    #[error("network: {0}")]
    NetworkTransient(String),
    /// The collector answered 401 to an upload.
    #[error("bearer token expired or rejected")]
    TokenExpired,
    #[error("uploader is offline")]
    Offline,
    #[error("collector rejected upload ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("local store: {0}")]
    Store(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::NetworkTransient(_)
                | UploadError::TokenExpired
                | UploadError::Rejected { .. }
        )
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::NetworkTransient(err.to_string())
    }
}
