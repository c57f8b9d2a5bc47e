use serde::Serialize;
use std::fmt;

use crate::auth::AuthState;
use crate::queue::QueueStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Offline,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Offline => f.write_str("offline"),
        }
    }
}

/// Point-in-time view of an uploader, safe to print or serialise.
#[derive(Debug, Clone, Serialize)]
pub struct UploaderStatus {
    pub state: ConnectionState,
    pub auth_state: AuthState,
    pub token_valid: bool,
    pub pending_files: usize,
    pub queued: usize,
    pub stats: QueueStats,
    pub synced_total: u64,
}

impl UploaderStatus {
    pub fn has_pending(&self) -> bool {
        self.pending_files > 0
    }
}

impl fmt::Display for UploaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Connection:    {}", self.state)?;
        writeln!(f, "Token valid:   {}", if self.token_valid { "yes" } else { "no" })?;
        writeln!(f, "Pending files: {}", self.pending_files)?;
        write!(f, "Queued:        {}", self.queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_lowercase_state() {
        assert_eq!(ConnectionState::Offline.to_string(), "offline");
        assert_eq!(
            serde_json::to_value(ConnectionState::Connected).unwrap(),
            serde_json::json!("connected")
        );
    }

    #[test]
    fn pending_flag_follows_file_count() {
        let status = UploaderStatus {
            state: ConnectionState::Offline,
            auth_state: AuthState::Offline,
            token_valid: false,
            pending_files: 2,
            queued: 0,
            stats: QueueStats::default(),
            synced_total: 0,
        };
        assert!(status.has_pending());
        assert!(status.to_string().contains("Pending files: 2"));
    }
}
