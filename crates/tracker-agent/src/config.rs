use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracker_core::paths;

use crate::backoff::BackoffPolicy;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:5000";
pub const DEFAULT_DEVICE_TYPE: &str = "Gaming PC";

/// Everything the uploader needs, handed to each component at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server_url: String,
    pub device_type: String,
    pub device_name: String,
    pub data_dir: PathBuf,
    pub auth_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub backoff: BackoffPolicy,
    /// Queue items older than this skip the network and go to local storage.
    /// Applies while connected too: a backlog that outlives this threshold is
    /// handed to the resync loop instead of the in-memory queue.
    pub stale_after_ms: u64,
    pub resync_interval_ms: u64,
    /// How often an offline uploader force-retries authentication.
    pub offline_probe_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub start_offline: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            device_name: default_device_name(),
            data_dir: paths::data_dir().unwrap_or_else(|_| PathBuf::from(".secure-tracker")),
            auth_timeout_ms: 10_000,
            upload_timeout_ms: 15_000,
            probe_timeout_ms: 5_000,
            backoff: BackoffPolicy::default(),
            stale_after_ms: 10 * 60 * 1_000,
            resync_interval_ms: 60_000,
            offline_probe_interval_ms: 120_000,
            shutdown_timeout_ms: 10_000,
            start_offline: false,
        }
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-device".to_string())
}

impl AgentConfig {
    /// Defaults, then `agent.json` in the data directory, then environment.
    pub fn load(data_dir_override: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir_override {
            Some(dir) => dir,
            None => paths::data_dir()?,
        };
        let file = paths::agent_config_path(&data_dir);
        let mut config = if file.exists() {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))?;
            serde_json::from_str::<AgentConfig>(&raw)
                .with_context(|| format!("parse {}", file.display()))?
        } else {
            AgentConfig::default()
        };
        config.data_dir = data_dir;
        if let Ok(url) = std::env::var("TRACKER_SERVER_URL") {
            if !url.trim().is_empty() {
                config.server_url = url;
            }
        }
        config.server_url = config.server_url.trim_end_matches('/').to_string();
        Ok(config)
    }

    pub fn local_data_dir(&self) -> PathBuf {
        paths::local_data_dir(&self.data_dir)
    }

    pub fn credentials_path(&self) -> PathBuf {
        paths::credentials_path(&self.data_dir)
    }

    pub fn data_key_path(&self) -> PathBuf {
        paths::data_key_path(&self.data_dir)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn offline_probe_interval(&self) -> Duration {
        Duration::from_millis(self.offline_probe_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Test helper: a config rooted at `dir` pointed at `server_url`.
    pub fn for_dir(dir: &Path, server_url: &str) -> Self {
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            data_dir: dir.to_path_buf(),
            ..Self::default()
        }
    }
}
