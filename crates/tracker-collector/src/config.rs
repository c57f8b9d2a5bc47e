use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracker_core::wire::TIMESTAMP_WINDOW_SECS;

use crate::records::DEFAULT_RECORD_CAPACITY;

pub const DEFAULT_BIND: &str = "127.0.0.1:5000";
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 30 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub bind: String,
    pub token_ttl_secs: u64,
    /// Accepted skew, in either direction, for request timestamps.
    pub timestamp_window_secs: i64,
    /// Hex data key shared with the agents. Without it records are kept
    /// sealed.
    pub data_key_file: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
    pub audit_capacity: usize,
    /// Accepted records kept in memory, oldest evicted first.
    pub record_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            timestamp_window_secs: TIMESTAMP_WINDOW_SECS,
            data_key_file: None,
            audit_log: None,
            audit_capacity: 1_000,
            record_capacity: DEFAULT_RECORD_CAPACITY,
        }
    }
}

impl CollectorConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }
}
