//! Device-side resilient uploader.
//!
//! Producers hand sealed payloads to [`Uploader::enqueue`] and move on. A
//! single worker delivers them to the collector, falls back to the local
//! store when the network or authentication is unavailable, and a resync
//! loop drains the store once the collector is reachable again.

pub mod api_client;
pub mod auth;
pub mod backoff;
pub mod config;
pub mod delivery;
pub mod error;
pub mod ingest;
pub mod local_store;
pub mod queue;
pub mod resync;
pub mod status;
pub mod uploader;

pub use config::AgentConfig;
pub use error::UploadError;
pub use status::{ConnectionState, UploaderStatus};
pub use uploader::Uploader;
