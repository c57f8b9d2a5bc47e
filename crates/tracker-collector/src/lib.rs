//! Collector side of the tracker protocol: device login, token issuance and
//! verification of signed uploads.

pub mod audit;
pub mod config;
pub mod error;
pub mod records;
pub mod registry;
pub mod routes;
pub mod state;
pub mod tokens;
pub mod validation;

pub use config::CollectorConfig;
pub use error::ApiError;
pub use routes::app;
pub use state::{AppState, CollectorStats};
