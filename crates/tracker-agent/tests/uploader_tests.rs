use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::RngCore;
use serde_json::json;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracker_agent::backoff::BackoffPolicy;
use tracker_agent::{AgentConfig, ConnectionState, Uploader};
use tracker_collector::{app, AppState, CollectorConfig};
use tracker_core::sealing::integrity_hash;
use tracker_core::wire::{codes, ErrorBody, UPLOAD_PATH};
use tracker_core::{Credential, RecordSealer};

struct Collector {
    url: String,
    state: AppState,
    key: [u8; 32],
    task: tokio::task::JoinHandle<()>,
}

impl Collector {
    fn sealer(&self) -> RecordSealer {
        RecordSealer::new(self.key)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone, Copy)]
enum Fault {
    Unavailable,
    TokenRejected,
}

struct UploadFaults {
    kind: Fault,
    remaining: AtomicUsize,
}

impl UploadFaults {
    fn new(kind: Fault, count: usize) -> Arc<Self> {
        Arc::new(Self {
            kind,
            remaining: AtomicUsize::new(count),
        })
    }
}

async fn fail_first_uploads(
    State(faults): State<Arc<UploadFaults>>,
    req: Request,
    next: Next,
) -> Response {
    if req.uri().path() == UPLOAD_PATH
        && faults
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    {
        return match faults.kind {
            Fault::Unavailable => StatusCode::SERVICE_UNAVAILABLE.into_response(),
            Fault::TokenRejected => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: codes::TOKEN_INVALID.to_string(),
                    message: "token rejected".to_string(),
                }),
            )
                .into_response(),
        };
    }
    next.run(req).await
}

fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

async fn spawn_collector_on(
    listener: TcpListener,
    config: CollectorConfig,
    faults: Arc<UploadFaults>,
    key: [u8; 32],
) -> Collector {
    let state = AppState::with_sealer(config, Some(RecordSealer::new(key))).unwrap();
    let router = app(state.clone()).layer(middleware::from_fn_with_state(faults, fail_first_uploads));
    let url = format!("http://{}", listener.local_addr().unwrap());
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Collector { url, state, key, task }
}

async fn spawn_collector(config: CollectorConfig, flaky_uploads: usize) -> Collector {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    spawn_collector_on(listener, config, UploadFaults::new(Fault::Unavailable, flaky_uploads), random_key()).await
}

async fn spawn_token_rejecting_collector(rejected_uploads: usize) -> Collector {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let faults = UploadFaults::new(Fault::TokenRejected, rejected_uploads);
    spawn_collector_on(listener, CollectorConfig::default(), faults, random_key()).await
}

/// An address nothing listens on.
async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn fast_config(dir: &Path, url: &str) -> AgentConfig {
    let mut config = AgentConfig::for_dir(dir, url);
    config.backoff = BackoffPolicy {
        max_retries: 5,
        initial_delay_ms: 10,
        factor: 1.5,
        max_delay_ms: 50,
    };
    config.auth_timeout_ms = 2_000;
    config.upload_timeout_ms = 2_000;
    config.probe_timeout_ms = 500;
    config.resync_interval_ms = 3_600_000;
    config.offline_probe_interval_ms = 0;
    config.shutdown_timeout_ms = 5_000;
    config
}

fn start(config: AgentConfig) -> (Uploader, Credential) {
    let path = config.credentials_path();
    let credential = Credential::load_or_create(&path).unwrap();
    let uploader = Uploader::start(config, credential.clone(), Some(path)).unwrap();
    (uploader, credential)
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delivers_after_transient_failures() {
    let collector = spawn_collector(CollectorConfig::default(), 3).await;
    let dir = tempfile::tempdir().unwrap();
    let (uploader, _) = start(fast_config(dir.path(), &collector.url));

    let record = json!({"cpu": 55.0, "fps": 120});
    uploader.enqueue(collector.sealer().seal(&record).unwrap());

    let records = collector.state.records();
    assert!(wait_until(Duration::from_secs(5), || records.len() == 1).await);
    let hash = integrity_hash(&record).unwrap();
    assert_eq!(records.find_by_integrity_hash(&hash).len(), 1);

    let status = uploader.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.stats.retried, 3);
    assert_eq!(status.stats.delivered, 1);
    assert_eq!(status.pending_files, 0);
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_demote_to_local_store() {
    let collector = spawn_collector(CollectorConfig::default(), 100).await;
    let dir = tempfile::tempdir().unwrap();
    let (uploader, _) = start(fast_config(dir.path(), &collector.url));

    let sealed = collector.sealer().seal(&json!({"cpu": 1})).unwrap();
    uploader.enqueue(sealed.clone());

    assert!(wait_until(Duration::from_secs(5), || uploader.status().pending_files == 1).await);
    assert!(collector.state.records().is_empty());
    let stored = uploader.store().list_pending().unwrap();
    assert_eq!(std::fs::read(&stored[0]).unwrap(), sealed);
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enqueue_returns_immediately_while_unreachable() {
    let addr = closed_addr().await;
    let dir = tempfile::tempdir().unwrap();
    let (uploader, _) = start(fast_config(dir.path(), &format!("http://{addr}")));

    let mut payloads = HashSet::new();
    for i in 0..50u32 {
        let payload = format!("payload-{i}").into_bytes();
        payloads.insert(payload.clone());
        let started = Instant::now();
        uploader.enqueue(payload);
        assert!(started.elapsed() < Duration::from_millis(10));
    }
    uploader.shutdown().await;

    let stored: HashSet<Vec<u8>> = uploader
        .store()
        .list_pending()
        .unwrap()
        .iter()
        .map(|p| std::fs::read(p).unwrap())
        .collect();
    assert_eq!(stored, payloads);
    assert_eq!(uploader.status().state, ConnectionState::Offline);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offline_mode_writes_every_payload_to_disk() {
    let collector = spawn_collector(CollectorConfig::default(), 0).await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path(), &collector.url);
    config.start_offline = true;
    let (uploader, credential) = start(config);

    for i in 0..10u8 {
        uploader.enqueue(vec![i; 16]);
    }
    uploader.shutdown().await;

    let pending = uploader.store().list_pending().unwrap();
    assert_eq!(pending.len(), 10);
    for path in &pending {
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(&format!("_{}.dat", credential.client_id)));
    }
    assert_eq!(collector.state.stats().logins, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stranded_payload_is_delivered_once_collector_appears() {
    let addr = closed_addr().await;
    let dir = tempfile::tempdir().unwrap();
    let (uploader, credential) = start(fast_config(dir.path(), &format!("http://{addr}")));

    let key = random_key();
    let record = json!({"gpu": 71, "session": "abc"});
    let sealed = RecordSealer::new(key).seal(&record).unwrap();
    uploader.enqueue(sealed.clone());

    assert!(wait_until(Duration::from_secs(5), || uploader.status().pending_files == 1).await);
    let stored = uploader.store().list_pending().unwrap();
    assert!(stored[0]
        .to_str()
        .unwrap()
        .ends_with(&format!("_{}.dat", credential.client_id)));
    assert_eq!(std::fs::read(&stored[0]).unwrap(), sealed);
    assert_eq!(uploader.status().state, ConnectionState::Offline);

    // the collector comes up on the address the agent was given
    let listener = TcpListener::bind(addr).await.unwrap();
    let collector = spawn_collector_on(listener, CollectorConfig::default(), UploadFaults::new(Fault::Unavailable, 0), key).await;

    assert_eq!(uploader.sync_now().await, 1);
    assert_eq!(uploader.status().pending_files, 0);
    assert_eq!(uploader.status().state, ConnectionState::Connected);
    let hash = integrity_hash(&record).unwrap();
    assert_eq!(collector.state.records().find_by_integrity_hash(&hash).len(), 1);
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_resync_is_idempotent() {
    let collector = spawn_collector(CollectorConfig::default(), 0).await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path(), &collector.url);
    config.start_offline = true;
    let (uploader, _) = start(config);

    let sealer = collector.sealer();
    for i in 0..3 {
        uploader.enqueue(sealer.seal(&json!({"i": i})).unwrap());
    }
    assert!(wait_until(Duration::from_secs(5), || uploader.status().pending_files == 3).await);

    assert_eq!(uploader.sync_now().await, 3);
    let after_first = uploader.store().list_pending().unwrap();
    assert_eq!(uploader.sync_now().await, 0);
    assert_eq!(uploader.store().list_pending().unwrap(), after_first);
    assert_eq!(collector.state.records().len(), 3);
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_resyncs_leave_the_same_files() {
    let addr = closed_addr().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path(), &format!("http://{addr}"));
    config.start_offline = true;
    config.backoff.max_retries = 0;
    let (uploader, _) = start(config);

    uploader.enqueue(b"one".to_vec());
    uploader.enqueue(b"two".to_vec());
    assert!(wait_until(Duration::from_secs(5), || uploader.status().pending_files == 2).await);

    let before = uploader.store().list_pending().unwrap();
    assert_eq!(uploader.sync_now().await, 0);
    assert_eq!(uploader.sync_now().await, 0);
    assert_eq!(uploader.store().list_pending().unwrap(), before);
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_token_triggers_exactly_one_new_login() {
    let collector = spawn_collector(
        CollectorConfig {
            token_ttl_secs: 2,
            ..CollectorConfig::default()
        },
        0,
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let (uploader, _) = start(fast_config(dir.path(), &collector.url));
    let sealer = collector.sealer();
    let records = collector.state.records();

    uploader.enqueue(sealer.seal(&json!({"n": 1})).unwrap());
    assert!(wait_until(Duration::from_secs(5), || records.len() == 1).await);
    assert_eq!(uploader.authenticator().login_count(), 1);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(!uploader.status().token_valid);

    uploader.enqueue(sealer.seal(&json!({"n": 2})).unwrap());
    assert!(wait_until(Duration::from_secs(5), || records.len() == 2).await);
    assert_eq!(uploader.authenticator().login_count(), 2);
    assert_eq!(collector.state.stats().logins, 2);
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_login_registers_and_persists_flag() {
    let collector = spawn_collector(CollectorConfig::default(), 0).await;
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path(), &collector.url);
    let cred_path = config.credentials_path();
    let (uploader, credential) = start(config);
    assert!(!credential.registered);

    uploader.enqueue(collector.sealer().seal(&json!({"x": 1})).unwrap());
    assert!(wait_until(Duration::from_secs(5), || collector.state.records().len() == 1).await);
    assert_eq!(collector.state.stats().registrations, 1);
    assert!(Credential::load(&cred_path).unwrap().registered);
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_payload_arrives_despite_early_failures() {
    let collector = spawn_collector(CollectorConfig::default(), 3).await;
    let dir = tempfile::tempdir().unwrap();
    let (uploader, _) = start(fast_config(dir.path(), &collector.url));
    let sealer = collector.sealer();

    let records: Vec<_> = (0..5).map(|i| json!({"frame": i, "fps": 60 + i})).collect();
    for record in &records {
        uploader.enqueue(sealer.seal(record).unwrap());
    }

    let stored = collector.state.records();
    assert!(wait_until(Duration::from_secs(5), || stored.len() == 5).await);
    for record in &records {
        let hash = integrity_hash(record).unwrap();
        assert_eq!(stored.find_by_integrity_hash(&hash).len(), 1);
    }
    let status = uploader.status();
    assert_eq!(status.stats.delivered, 5);
    assert_eq!(status.stats.retried, 3);
    assert_eq!(status.pending_files, 0);
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_token_is_replaced_once_without_a_retry() {
    let collector = spawn_token_rejecting_collector(1).await;
    let dir = tempfile::tempdir().unwrap();
    let (uploader, _) = start(fast_config(dir.path(), &collector.url));

    uploader.enqueue(collector.sealer().seal(&json!({"cpu": 12})).unwrap());
    let records = collector.state.records();
    assert!(wait_until(Duration::from_secs(5), || records.len() == 1).await);

    assert_eq!(uploader.authenticator().login_count(), 2);
    assert_eq!(collector.state.stats().logins, 2);
    let status = uploader.status();
    assert_eq!(status.stats.retried, 0);
    assert_eq!(status.stats.delivered, 1);
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_token_rejection_counts_as_a_retry() {
    let collector = spawn_token_rejecting_collector(2).await;
    let dir = tempfile::tempdir().unwrap();
    let (uploader, _) = start(fast_config(dir.path(), &collector.url));

    uploader.enqueue(collector.sealer().seal(&json!({"cpu": 13})).unwrap());
    let records = collector.state.records();
    assert!(wait_until(Duration::from_secs(5), || records.len() == 1).await);

    assert_eq!(uploader.authenticator().login_count(), 3);
    assert_eq!(uploader.status().stats.retried, 1);
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistent_token_rejection_ends_on_disk() {
    let collector = spawn_token_rejecting_collector(100).await;
    let dir = tempfile::tempdir().unwrap();
    let (uploader, _) = start(fast_config(dir.path(), &collector.url));

    let sealed = collector.sealer().seal(&json!({"cpu": 14})).unwrap();
    uploader.enqueue(sealed.clone());
    assert!(wait_until(Duration::from_secs(5), || uploader.status().pending_files == 1).await);

    let status = uploader.status();
    assert_eq!(status.stats.retried, 5);
    assert_eq!(status.stats.stored, 1);
    assert!(collector.state.records().is_empty());
    let stored = uploader.store().list_pending().unwrap();
    assert_eq!(std::fs::read(&stored[0]).unwrap(), sealed);
    uploader.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_reauthenticates_when_a_token_is_rejected_mid_cycle() {
    let collector = spawn_token_rejecting_collector(1).await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path(), &collector.url);
    config.start_offline = true;
    let (uploader, _) = start(config);

    let sealer = collector.sealer();
    for i in 0..3 {
        uploader.enqueue(sealer.seal(&json!({"i": i})).unwrap());
    }
    assert!(wait_until(Duration::from_secs(5), || uploader.status().pending_files == 3).await);

    // the rejected file stays behind, the rest go out under a fresh token
    assert_eq!(uploader.sync_now().await, 2);
    assert_eq!(uploader.status().pending_files, 1);
    assert_eq!(uploader.authenticator().login_count(), 2);

    assert_eq!(uploader.sync_now().await, 1);
    assert_eq!(uploader.status().pending_files, 0);
    assert_eq!(collector.state.records().len(), 3);
    assert_eq!(uploader.authenticator().login_count(), 2);
    uploader.shutdown().await;
}
