//! Fire-and-forget delivery queue.
//!
//! `enqueue` pushes onto an unbounded channel and returns; one background
//! task pops items in order and tries to deliver them. Retries go back to the
//! tail, so ordering is best effort. An item leaves the queue only by being
//! delivered or by being written to the [`LocalStore`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{EnsureMode, TokenAuthenticator};
use crate::backoff::BackoffPolicy;
use crate::delivery::Courier;
use crate::error::UploadError;
use crate::local_store::LocalStore;

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Set after the one free re-authentication a 401 earns an item.
    pub token_refreshed: bool,
}

impl QueueItem {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            token_refreshed: false,
        }
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.enqueued_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub backoff: BackoffPolicy,
    pub stale_after: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    stored: AtomicU64,
    retried: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub delivered: u64,
    pub stored: u64,
    pub retried: u64,
}

enum Outcome {
    Done,
    Requeue(QueueItem),
}

pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
    depth: Arc<AtomicUsize>,
    counters: Arc<Counters>,
    store: Arc<LocalStore>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryQueue {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(courier: Arc<Courier>, store: Arc<LocalStore>, policy: QueuePolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let depth = Arc::new(AtomicUsize::new(0));
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            auth: courier.authenticator().clone(),
            courier,
            store: store.clone(),
            policy,
            counters: counters.clone(),
        };
        let handle = tokio::spawn(worker.run(rx, tx.clone(), depth.clone(), shutdown_rx));

        Self {
            tx,
            depth,
            counters,
            store,
            shutdown_tx,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Never blocks and never fails observably. Once the worker is gone the
    /// payload is written straight to local storage instead.
    pub fn enqueue(&self, payload: Vec<u8>) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(item)) = self.tx.send(QueueItem::new(payload)) {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            warn!("delivery queue closed, storing payload directly");
            if let Err(err) = self.store.persist(&item.payload) {
                warn!(error = %err, "failed to store payload after shutdown");
            } else {
                self.counters.stored.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Items waiting in the channel (not counting the one in flight).
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            stored: self.counters.stored.load(Ordering::SeqCst),
            retried: self.counters.retried.load(Ordering::SeqCst),
        }
    }

    /// Stop the worker. Everything still queued, waiting on a backoff or in
    /// flight is written to local storage before the worker exits.
    pub async fn shutdown(&self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => debug!("delivery worker stopped"),
                Ok(Err(err)) => warn!(error = %err, "delivery worker panicked"),
                Err(_) => warn!(timeout_ms = timeout.as_millis() as u64, "delivery worker did not stop in time"),
            }
        }
    }
}

struct Worker {
    courier: Arc<Courier>,
    auth: Arc<TokenAuthenticator>,
    store: Arc<LocalStore>,
    policy: QueuePolicy,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<QueueItem>,
        requeue: mpsc::UnboundedSender<QueueItem>,
        depth: Arc<AtomicUsize>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("delivery worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let item = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            depth.fetch_sub(1, Ordering::SeqCst);

            let fallback = item.payload.clone();
            let outcome = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    self.demote(&fallback, "shutdown during delivery");
                    break;
                }
                outcome = self.process(item) => outcome,
            };
            if let Outcome::Requeue(item) = outcome {
                depth.fetch_add(1, Ordering::SeqCst);
                if let Err(mpsc::error::SendError(item)) = requeue.send(item) {
                    depth.fetch_sub(1, Ordering::SeqCst);
                    self.demote(&item.payload, "queue closed");
                }
            }
        }

        rx.close();
        let mut drained = 0usize;
        while let Ok(item) = rx.try_recv() {
            depth.fetch_sub(1, Ordering::SeqCst);
            self.demote(&item.payload, "shutdown drain");
            drained += 1;
        }
        info!(drained, "delivery worker stopped");
    }

    async fn process(&self, mut item: QueueItem) -> Outcome {
        if self.auth.is_offline() {
            self.demote(&item.payload, "offline");
            return Outcome::Done;
        }
        if item.age(Utc::now()) > self.policy.stale_after {
            self.demote(&item.payload, "stale");
            return Outcome::Done;
        }

        let token = match self.auth.ensure_token(EnsureMode::Normal).await {
            Ok(token) => token,
            Err(err) => {
                debug!(error = %err, "no token for delivery");
                self.demote(&item.payload, "authentication unavailable");
                return Outcome::Done;
            }
        };

        match self.courier.send_with_token(&token, &item.payload).await {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::SeqCst);
                debug!(retries = item.retry_count, "payload delivered");
                Outcome::Done
            }
            Err(UploadError::TokenExpired) if !item.token_refreshed => {
                debug!("upload token rejected, re-authenticating once");
                item.token_refreshed = true;
                Outcome::Requeue(item)
            }
            Err(err) if item.retry_count < self.policy.backoff.max_retries => {
                let delay = self.policy.backoff.delay(item.retry_count);
                warn!(error = %err, retry = item.retry_count + 1, delay_ms = delay.as_millis() as u64, "upload failed, will retry");
                tokio::time::sleep(delay).await;
                item.retry_count += 1;
                self.counters.retried.fetch_add(1, Ordering::SeqCst);
                Outcome::Requeue(item)
            }
            Err(err) => {
                warn!(error = %err, retries = item.retry_count, "upload retries exhausted");
                self.demote(&item.payload, "retries exhausted");
                Outcome::Done
            }
        }
    }

    fn demote(&self, payload: &[u8], reason: &str) {
        match self.store.persist(payload) {
            Ok(path) => {
                self.counters.stored.fetch_add(1, Ordering::SeqCst);
                debug!(reason, path = %path.display(), "payload demoted to local storage");
            }
            Err(err) => warn!(reason, error = %err, "failed to store payload locally"),
        }
    }
}
