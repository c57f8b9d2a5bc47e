//! Durable fallback for payloads that could not be delivered.
//!
//! Layout: `local_data/{unix_ts}_{client_id}.dat`, raw ciphertext, no header,
//! owner-only permissions. The timestamp is the store time. A second payload
//! stored in the same second for the same client gets `{unix_ts}-{n}_...`.

use chrono::{DateTime, TimeZone, Utc};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracker_core::secure_storage::{create_private_new, ensure_private_dir};

pub const RECORD_EXTENSION: &str = "dat";

/// A stranded payload file, identified by its parsed name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub path: PathBuf,
    pub stored_at: i64,
    pub seq: u32,
    pub client_id: String,
}

impl StoredRecord {
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(".dat")?;
        let (stamp, client_id) = stem.split_once('_')?;
        let (ts, seq) = match stamp.split_once('-') {
            Some((ts, seq)) => (ts.parse().ok()?, seq.parse().ok()?),
            None => (stamp.parse().ok()?, 0),
        };
        if client_id.is_empty() {
            return None;
        }
        Some(Self {
            path: path.to_path_buf(),
            stored_at: ts,
            seq,
            client_id: client_id.to_string(),
        })
    }

    pub fn stored_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.stored_at, 0).single()
    }
}

pub struct LocalStore {
    dir: PathBuf,
    client_id: String,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>, client_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            client_id: client_id.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `payload` to a fresh file. Never overwrites an existing record;
    /// the content is staged under a temp name and hard-linked into place so
    /// a concurrent scan never sees a half-written `.dat` file.
    pub fn persist(&self, payload: &[u8]) -> io::Result<PathBuf> {
        ensure_private_dir(&self.dir)?;
        let ts = Utc::now().timestamp();
        let staging = {
            let (staging, mut file) = self.create_staging(ts)?;
            let written = file.write_all(payload).and_then(|_| file.sync_all());
            if let Err(e) = written {
                let _ = fs::remove_file(&staging);
                return Err(e);
            }
            staging
        };
        let result = self.link_into_place(&staging, ts);
        let _ = fs::remove_file(&staging);
        let path = result?;
        info!(path = %path.display(), bytes = payload.len(), "payload stored locally");
        Ok(path)
    }

    fn create_staging(&self, ts: i64) -> io::Result<(PathBuf, fs::File)> {
        let mut n = 0u32;
        loop {
            let path = self.dir.join(format!(
                ".{}_{}.{}-{}.tmp",
                ts,
                self.client_id,
                std::process::id(),
                n
            ));
            match create_private_new(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn link_into_place(&self, staging: &Path, ts: i64) -> io::Result<PathBuf> {
        let mut seq = 0u32;
        loop {
            let name = if seq == 0 {
                format!("{}_{}.{}", ts, self.client_id, RECORD_EXTENSION)
            } else {
                format!("{}-{}_{}.{}", ts, seq, self.client_id, RECORD_EXTENSION)
            };
            let target = self.dir.join(name);
            match fs::hard_link(staging, &target) {
                Ok(()) => return Ok(target),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => seq += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Pending records, oldest first by filename timestamp.
    pub fn list_pending(&self) -> io::Result<Vec<PathBuf>> {
        Ok(self.pending_records()?.into_iter().map(|r| r.path).collect())
    }

    pub fn pending_records(&self) -> io::Result<Vec<StoredRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        let mut records: Vec<StoredRecord> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| StoredRecord::parse(&entry.path()))
            .collect();
        records.sort_by(|a, b| {
            (a.stored_at, a.seq, &a.client_id).cmp(&(b.stored_at, b.seq, &b.client_id))
        });
        Ok(records)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_records().map(|r| r.len()).unwrap_or(0)
    }

    pub fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    /// Removing a record that is already gone is not an error.
    pub fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "stored payload removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
