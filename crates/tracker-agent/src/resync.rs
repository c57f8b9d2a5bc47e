//! Periodic re-delivery of payloads stranded in the local store.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{EnsureMode, TokenAuthenticator};
use crate::delivery::Courier;
use crate::error::UploadError;
use crate::local_store::LocalStore;

pub struct Resyncer {
    courier: Arc<Courier>,
    auth: Arc<TokenAuthenticator>,
    store: Arc<LocalStore>,
    probe_interval: Duration,
    last_probe: Mutex<Option<Instant>>,
    // serialises cycles so a manual sync and the timer never race on a file
    cycle: tokio::sync::Mutex<()>,
    synced_total: AtomicU64,
}

impl Resyncer {
    pub fn new(courier: Arc<Courier>, store: Arc<LocalStore>, probe_interval: Duration) -> Self {
        Self {
            auth: courier.authenticator().clone(),
            courier,
            store,
            probe_interval,
            last_probe: Mutex::new(None),
            cycle: tokio::sync::Mutex::new(()),
            synced_total: AtomicU64::new(0),
        }
    }

    pub fn synced_total(&self) -> u64 {
        self.synced_total.load(Ordering::SeqCst)
    }

    /// True when an offline agent is due for another forced login attempt.
    fn probe_due(&self) -> bool {
        let mut last = self.last_probe.lock();
        let due = match *last {
            Some(at) => at.elapsed() >= self.probe_interval,
            None => true,
        };
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    /// One pass over the local store. Returns how many files were delivered
    /// and removed.
    pub async fn sync_once(&self) -> usize {
        let _cycle = self.cycle.lock().await;

        let mode = if self.auth.is_offline() {
            if !self.probe_due() {
                debug!("offline, skipping resync cycle");
                return 0;
            }
            info!("offline, probing collector with a forced login");
            EnsureMode::ForceRetry
        } else {
            EnsureMode::Normal
        };

        let token = match self.auth.ensure_token(mode).await {
            Ok(token) => token,
            Err(err) => {
                debug!(error = %err, "resync aborted, no token");
                return 0;
            }
        };

        let pending = match self.store.list_pending() {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "failed to list pending records");
                return 0;
            }
        };
        if pending.is_empty() {
            return 0;
        }

        let mut synced = 0usize;
        let mut token = token;
        for path in pending {
            let payload = match self.store.read(&path) {
                Ok(payload) => payload,
                Err(err) => {
                    // removed by a concurrent cycle or unreadable; next file
                    debug!(path = %path.display(), error = %err, "skipping unreadable record");
                    continue;
                }
            };
            match self.courier.send_with_token(&token, &payload).await {
                Ok(()) => match self.store.remove(&path) {
                    Ok(()) => synced += 1,
                    Err(err) => warn!(path = %path.display(), error = %err, "delivered record could not be removed"),
                },
                Err(UploadError::TokenExpired) => {
                    // one fresh token for the remaining files; this file waits
                    match self.auth.ensure_token(EnsureMode::Normal).await {
                        Ok(fresh) => token = fresh,
                        Err(err) => {
                            debug!(error = %err, "resync stopped, re-authentication failed");
                            break;
                        }
                    }
                }
                Err(err @ (UploadError::Offline | UploadError::AuthFailure { .. } | UploadError::NetworkTransient(_))) => {
                    debug!(error = %err, "resync stopped, collector unavailable");
                    break;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "record rejected, leaving for next cycle");
                }
            }
        }

        if synced > 0 {
            self.synced_total.fetch_add(synced as u64, Ordering::SeqCst);
            info!(synced, remaining = self.store.pending_count(), "resync cycle complete");
        }
        synced
    }
}

/// Control handle for a spawned resync loop.
pub struct ResyncHandle {
    /// Wakes the loop for an immediate cycle.
    pub wake: Arc<Notify>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl ResyncHandle {
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Run `sync_once` every `interval` until stopped.
pub fn spawn_resync_loop(resyncer: Arc<Resyncer>, interval: Duration) -> (JoinHandle<()>, ResyncHandle) {
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let wake_loop = wake.clone();

    let handle = tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "resync loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake_loop.notified() => debug!("resync loop woken early"),
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = resyncer.sync_once() => {}
                _ = shutdown_rx.changed() => break,
            }
        }
        info!("resync loop stopped");
    });

    (handle, ResyncHandle { wake, shutdown_tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::ApiClient;
    use crate::config::AgentConfig;
    use tracker_core::Credential;

    fn offline_resyncer(dir: &std::path::Path, probe_interval: Duration) -> Resyncer {
        let config = AgentConfig::for_dir(dir, "http://127.0.0.1:9");
        let client = ApiClient::new(&config).unwrap();
        let auth = Arc::new(TokenAuthenticator::new(
            client.clone(),
            &config,
            Credential::generate(),
            None,
        ));
        auth.set_offline(true);
        let courier = Arc::new(Courier::new(client, auth));
        Resyncer::new(courier, Arc::new(LocalStore::new(dir, "dev")), probe_interval)
    }

    #[test]
    fn probe_is_due_once_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let resyncer = offline_resyncer(dir.path(), Duration::from_secs(3600));
        assert!(resyncer.probe_due());
        assert!(!resyncer.probe_due());

        let eager = offline_resyncer(dir.path(), Duration::ZERO);
        assert!(eager.probe_due());
        assert!(eager.probe_due());
    }

    #[tokio::test]
    async fn offline_cycle_between_probes_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let resyncer = offline_resyncer(dir.path(), Duration::from_secs(3600));
        resyncer.store.persist(b"stranded").unwrap();
        resyncer.probe_due();

        assert_eq!(resyncer.sync_once().await, 0);
        assert_eq!(resyncer.store.pending_count(), 1);
        assert_eq!(resyncer.auth.login_count(), 0);
    }
}
