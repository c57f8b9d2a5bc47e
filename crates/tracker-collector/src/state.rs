use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracker_core::RecordSealer;

use crate::audit::{SecurityAuditLog, Severity};
use crate::config::CollectorConfig;
use crate::records::RecordStore;
use crate::registry::DeviceRegistry;
use crate::tokens::TokenIssuer;
use crate::validation::ReplayGuard;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub logins: AtomicU64,
    pub registrations: AtomicU64,
    pub uploads: AtomicU64,
    pub duplicates: AtomicU64,
    pub rejections: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    pub logins: u64,
    pub registrations: u64,
    pub uploads: u64,
    pub duplicates: u64,
    pub rejections: u64,
}

pub(crate) struct Inner {
    pub config: CollectorConfig,
    pub registry: DeviceRegistry,
    pub tokens: TokenIssuer,
    pub nonces: ReplayGuard,
    pub signatures: ReplayGuard,
    pub records: RecordStore,
    pub audit: SecurityAuditLog,
    pub sealer: Option<RecordSealer>,
    pub counters: Counters,
}

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub(crate) inner: Arc<Inner>,
}

impl AppState {
    pub fn new(config: CollectorConfig) -> Result<Self> {
        let sealer = match &config.data_key_file {
            Some(path) => Some(
                RecordSealer::load(path)
                    .with_context(|| format!("load data key {}", path.display()))?,
            ),
            None => None,
        };
        Self::with_sealer(config, sealer)
    }

    /// Like [`AppState::new`] with the data key supplied directly.
    pub fn with_sealer(config: CollectorConfig, sealer: Option<RecordSealer>) -> Result<Self> {
        let audit = match &config.audit_log {
            Some(path) => SecurityAuditLog::with_sink(config.audit_capacity, path)
                .with_context(|| format!("open audit log {}", path.display()))?,
            None => SecurityAuditLog::new(config.audit_capacity),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                tokens: TokenIssuer::new(config.token_ttl_secs),
                registry: DeviceRegistry::new(),
                nonces: ReplayGuard::new(),
                signatures: ReplayGuard::new(),
                records: RecordStore::with_capacity(config.record_capacity),
                audit,
                sealer,
                counters: Counters::default(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn records(&self) -> &RecordStore {
        &self.inner.records
    }

    pub fn audit(&self) -> &SecurityAuditLog {
        &self.inner.audit
    }

    pub fn stats(&self) -> CollectorStats {
        let c = &self.inner.counters;
        CollectorStats {
            logins: c.logins.load(Ordering::SeqCst),
            registrations: c.registrations.load(Ordering::SeqCst),
            uploads: c.uploads.load(Ordering::SeqCst),
            duplicates: c.duplicates.load(Ordering::SeqCst),
            rejections: c.rejections.load(Ordering::SeqCst),
        }
    }

    /// Mark a device revoked and kill every token it holds.
    pub fn revoke_device(&self, client_id: &str) -> bool {
        if !self.inner.registry.revoke(client_id) {
            return false;
        }
        self.inner.tokens.revoke_subject(client_id, Utc::now());
        self.inner
            .audit
            .record("device_revoked", Severity::Warning, Some(client_id), json!({}));
        true
    }

    /// Revoke a single bearer token. Returns false if it was not valid.
    pub fn revoke_token(&self, token: &str) -> bool {
        match self.inner.tokens.verify(token, Utc::now()) {
            Ok(claims) => {
                self.inner.tokens.revoke(&claims);
                self.inner.audit.record(
                    "token_revoked",
                    Severity::Info,
                    Some(&claims.sub),
                    json!({ "jti": claims.jti }),
                );
                true
            }
            Err(_) => false,
        }
    }

    /// Drop replay and revocation entries that can no longer matter.
    pub fn prune(&self) {
        let now = Utc::now();
        self.inner.nonces.prune(now);
        self.inner.signatures.prune(now);
        self.inner.tokens.prune(now);
    }
}
