use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

/// One accepted upload.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMetric {
    pub client_id: String,
    pub received_at: DateTime<Utc>,
    pub data_type: String,
    /// sha256 of the ciphertext, used for duplicate detection
    pub digest: String,
    /// Present when the collector holds the data key.
    pub integrity_hash: Option<String>,
    pub record: Option<Value>,
    #[serde(skip)]
    pub ciphertext: Vec<u8>,
}

pub const DEFAULT_RECORD_CAPACITY: usize = 100_000;

#[derive(Default)]
struct Inner {
    metrics: VecDeque<StoredMetric>,
    digests: HashSet<String>,
}

/// In-memory sink for delivered records. Deduplicates on payload digest so
/// at-least-once delivery from the agents stores each payload once.
///
/// Holds at most `capacity` records; the oldest record and its digest are
/// dropped first, so duplicate detection covers the retained window only.
pub struct RecordStore {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RECORD_CAPACITY)
    }
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if a payload with the same digest is still retained.
    pub fn insert(&self, metric: StoredMetric) -> bool {
        let mut inner = self.inner.lock();
        if !inner.digests.insert(metric.digest.clone()) {
            return false;
        }
        while inner.metrics.len() >= self.capacity {
            match inner.metrics.pop_front() {
                Some(evicted) => {
                    inner.digests.remove(&evicted.digest);
                }
                None => break,
            }
        }
        inner.metrics.push_back(metric);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_client(&self, client_id: &str) -> Vec<StoredMetric> {
        self.inner
            .lock()
            .metrics
            .iter()
            .filter(|m| m.client_id == client_id)
            .cloned()
            .collect()
    }

    pub fn find_by_integrity_hash(&self, hash: &str) -> Vec<StoredMetric> {
        self.inner
            .lock()
            .metrics
            .iter()
            .filter(|m| m.integrity_hash.as_deref() == Some(hash))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<StoredMetric> {
        self.inner.lock().metrics.iter().cloned().collect()
    }
}
