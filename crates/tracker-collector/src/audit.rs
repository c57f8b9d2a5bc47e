//! Security audit trail.
//!
//! Entries are hash-chained (`hash = sha256(canonical entry without hash)`,
//! each `prev_hash` pointing at the previous entry) and kept in a bounded
//! ring. An optional JSONL file receives every entry as well.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracker_core::signer::canonical_json;

pub const CHAIN_START: &str = "CHAIN_START";

const SENSITIVE_KEYS: &[&str] = &["password", "token", "secret", "key", "client_secret"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub details: Value,
    pub prev_hash: String,
    pub hash: String,
}

struct Chain {
    last_seq: u64,
    last_hash: String,
    ring: VecDeque<AuditEntry>,
}

pub struct SecurityAuditLog {
    capacity: usize,
    sink: Option<PathBuf>,
    inner: Mutex<Chain>,
}

impl SecurityAuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sink: None,
            inner: Mutex::new(Chain {
                last_seq: 0,
                last_hash: CHAIN_START.to_string(),
                ring: VecDeque::new(),
            }),
        }
    }

    /// Also append every entry to `path`, continuing the chain already in it.
    pub fn with_sink(capacity: usize, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log = Self::new(capacity);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if let Some(last) = raw.lines().rev().find(|l| !l.trim().is_empty()) {
                let entry: AuditEntry = serde_json::from_str(last)?;
                let mut chain = log.inner.lock();
                chain.last_seq = entry.seq;
                chain.last_hash = entry.hash;
            }
        }
        Ok(Self {
            sink: Some(path),
            ..log
        })
    }

    pub fn record(
        &self,
        event_type: &str,
        severity: Severity,
        client_id: Option<&str>,
        details: Value,
    ) -> AuditEntry {
        let details = redact(details);
        let mut chain = self.inner.lock();
        let mut entry = AuditEntry {
            seq: chain.last_seq + 1,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            severity,
            client_id: client_id.map(str::to_string),
            details,
            prev_hash: chain.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = entry_hash(&entry);

        match severity {
            Severity::Info => info!(target: "security", seq = entry.seq, event = event_type, client_id = ?client_id, details = %entry.details, "security event"),
            Severity::Warning => warn!(target: "security", seq = entry.seq, event = event_type, client_id = ?client_id, details = %entry.details, "security event"),
        }
        if let Some(path) = &self.sink {
            if let Err(err) = append_line(path, &entry) {
                warn!(error = %err, path = %path.display(), "failed to write audit entry");
            }
        }

        chain.last_seq = entry.seq;
        chain.last_hash = entry.hash.clone();
        if chain.ring.len() == self.capacity {
            chain.ring.pop_front();
        }
        chain.ring.push_back(entry.clone());
        entry
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.inner.lock().ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.inner
            .lock()
            .ring
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

fn entry_hash(entry: &AuditEntry) -> String {
    let mut value = serde_json::json!({
        "seq": entry.seq,
        "timestamp": entry.timestamp,
        "event_type": entry.event_type,
        "severity": entry.severity,
        "client_id": entry.client_id,
        "details": entry.details,
        "prev_hash": entry.prev_hash,
    });
    if entry.client_id.is_none() {
        if let Some(obj) = value.as_object_mut() {
            obj.remove("client_id");
        }
    }
    hex::encode(Sha256::digest(canonical_json(&value).as_bytes()))
}

/// Checks hashes and links of consecutive entries, oldest first.
pub fn verify_chain(entries: &[AuditEntry]) -> bool {
    entries.iter().enumerate().all(|(i, entry)| {
        let linked = i == 0 || entries[i - 1].hash == entry.prev_hash;
        linked && entry_hash(entry) == entry.hash
    })
}

fn redact(details: Value) -> Value {
    match details {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| !SENSITIVE_KEYS.contains(&k.to_ascii_lowercase().as_str()))
                .map(|(k, v)| (k, redact(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}

fn append_line(path: &Path, entry: &AuditEntry) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(entry)?)?;
    file.flush()?;
    Ok(())
}
