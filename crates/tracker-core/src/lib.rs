//! Shared building blocks for the secure telemetry tracker.
//!
//! Both the device-side agent and the collector depend on this crate so the
//! two ends agree byte-for-byte on what gets signed and what goes on the wire.

pub mod credentials;
pub mod error;
pub mod paths;
pub mod sealing;
pub mod secure_storage;
pub mod signer;
pub mod wire;

pub use credentials::Credential;
pub use error::{CoreError, CoreResult};
pub use sealing::RecordSealer;
