//! The assembled uploader: one queue worker, one resync loop, one
//! authenticator shared by both.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracker_core::Credential;

use crate::api_client::ApiClient;
use crate::auth::TokenAuthenticator;
use crate::config::AgentConfig;
use crate::delivery::Courier;
use crate::error::UploadError;
use crate::local_store::LocalStore;
use crate::queue::{DeliveryQueue, QueuePolicy};
use crate::resync::{spawn_resync_loop, ResyncHandle, Resyncer};
use crate::status::{ConnectionState, UploaderStatus};

pub struct Uploader {
    config: AgentConfig,
    auth: Arc<TokenAuthenticator>,
    store: Arc<LocalStore>,
    queue: DeliveryQueue,
    resyncer: Arc<Resyncer>,
    resync: ResyncHandle,
    resync_task: Mutex<Option<JoinHandle<()>>>,
}

impl Uploader {
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: AgentConfig,
        credential: Credential,
        credential_path: Option<PathBuf>,
    ) -> Result<Self, UploadError> {
        let client = ApiClient::new(&config)?;
        let store = Arc::new(LocalStore::new(
            config.local_data_dir(),
            credential.client_id.clone(),
        ));
        let auth = Arc::new(TokenAuthenticator::new(
            client.clone(),
            &config,
            credential,
            credential_path,
        ));
        if config.start_offline {
            auth.set_offline(true);
        }
        let courier = Arc::new(Courier::new(client, auth.clone()));

        let queue = DeliveryQueue::start(
            courier.clone(),
            store.clone(),
            QueuePolicy {
                backoff: config.backoff.clone(),
                stale_after: config.stale_after(),
            },
        );
        let resyncer = Arc::new(Resyncer::new(
            courier,
            store.clone(),
            config.offline_probe_interval(),
        ));
        let (resync_task, resync) = spawn_resync_loop(resyncer.clone(), config.resync_interval());

        info!(
            server = %config.server_url,
            client_id = %auth.credential().client_id,
            offline = config.start_offline,
            "uploader started"
        );

        Ok(Self {
            config,
            auth,
            store,
            queue,
            resyncer,
            resync,
            resync_task: Mutex::new(Some(resync_task)),
        })
    }

    /// Hand a sealed payload to the uploader. Returns immediately.
    pub fn enqueue(&self, payload: Vec<u8>) {
        self.queue.enqueue(payload);
    }

    /// Run a resync cycle now, outside the timer.
    pub async fn sync_now(&self) -> usize {
        self.resyncer.sync_once().await
    }

    /// Wake the background resync loop without waiting for it.
    pub fn trigger_resync(&self) {
        self.resync.trigger();
    }

    pub fn authenticator(&self) -> &Arc<TokenAuthenticator> {
        &self.auth
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn status(&self) -> UploaderStatus {
        UploaderStatus {
            state: if self.auth.is_offline() {
                ConnectionState::Offline
            } else {
                ConnectionState::Connected
            },
            auth_state: self.auth.state(),
            token_valid: self.auth.token_valid(),
            pending_files: self.store.pending_count(),
            queued: self.queue.len(),
            stats: self.queue.stats(),
            synced_total: self.resyncer.synced_total(),
        }
    }

    /// Stop the resync loop, then drain the queue to local storage.
    pub async fn shutdown(&self) {
        let timeout = self.config.shutdown_timeout();
        self.resync.stop();
        let task = self.resync_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!("resync loop did not stop in time");
            }
        }
        self.queue.shutdown(timeout).await;
        info!(pending_files = self.store.pending_count(), "uploader stopped");
    }
}
