use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracker_agent::api_client::ApiClient;
use tracker_agent::auth::{EnsureMode, TokenAuthenticator};
use tracker_agent::ingest::forward_ndjson;
use tracker_agent::local_store::LocalStore;
use tracker_agent::{AgentConfig, ConnectionState, Uploader};
use tracker_core::{Credential, RecordSealer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Secure Tracker device agent", long_about = None)]
struct Cli {
    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Override the collector URL
    #[arg(long, global = true)]
    server: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the device credential and data key
    Init,
    /// Seal JSON records read line by line from stdin and upload them
    Run {
        /// Skip the network and write everything to local storage
        #[arg(long)]
        offline: bool,
    },
    /// Show connectivity and pending local files
    Status,
    /// Authenticate once against the collector
    Test,
    /// Deliver pending local files now
    Sync,
    /// Print identity and file locations
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AgentConfig::load(cli.data_dir)?;
    if let Some(server) = cli.server {
        config.server_url = server.trim_end_matches('/').to_string();
    }

    match cli.command {
        Commands::Init => init_command(&config),
        Commands::Run { offline } => {
            config.start_offline |= offline;
            run_command(config).await
        }
        Commands::Status => status_command(&config).await,
        Commands::Test => test_command(&config).await,
        Commands::Sync => sync_command(config).await,
        Commands::Info => info_command(&config),
    }
}

fn init_command(config: &AgentConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create {}", config.data_dir.display()))?;
    let credential = Credential::load_or_create(&config.credentials_path())?;
    RecordSealer::load_or_create(&config.data_key_path())?;
    println!("Client ID: {}", credential.client_id);
    println!("Data directory: {}", config.data_dir.display());
    Ok(())
}

async fn run_command(config: AgentConfig) -> Result<()> {
    let credential_path = config.credentials_path();
    let credential = Credential::load_or_create(&credential_path)?;
    let sealer = RecordSealer::load_or_create(&config.data_key_path())?;
    let uploader = Uploader::start(config, credential, Some(credential_path))?;
    uploader.trigger_resync();

    let interrupt = async {
        let _ = signal::ctrl_c().await;
    };
    let accepted = forward_ndjson(BufReader::new(tokio::io::stdin()), &sealer, &uploader, interrupt).await;

    info!(accepted, "input closed, shutting down");
    uploader.shutdown().await;
    println!("{}", uploader.status());
    Ok(())
}

async fn status_command(config: &AgentConfig) -> Result<()> {
    let credential_path = config.credentials_path();
    let credential = Credential::load_or_create(&credential_path)?;
    let pending = LocalStore::new(config.local_data_dir(), credential.client_id.clone()).pending_count();

    let client = ApiClient::new(config)?;
    let reachable = client.probe().await.is_ok();
    let authenticated = reachable && {
        let mut quick = config.clone();
        quick.backoff.max_retries = 0;
        let auth = TokenAuthenticator::new(client, &quick, credential, Some(credential_path));
        auth.ensure_token(EnsureMode::ForceRetry).await.is_ok()
    };
    let state = if authenticated {
        ConnectionState::Connected
    } else {
        ConnectionState::Offline
    };

    println!("Server:        {}", config.server_url);
    println!("Connection:    {state}");
    println!("Pending files: {pending}");
    Ok(())
}

async fn test_command(config: &AgentConfig) -> Result<()> {
    let client = ApiClient::new(config)?;
    client
        .probe()
        .await
        .with_context(|| format!("collector at {} is unreachable", config.server_url))?;
    println!("Connectivity OK: {}", config.server_url);

    let credential_path = config.credentials_path();
    let credential = Credential::load_or_create(&credential_path)?;
    let auth = TokenAuthenticator::new(client, config, credential, Some(credential_path));
    auth.ensure_token(EnsureMode::ForceRetry)
        .await
        .context("authentication failed")?;
    println!("Authentication OK");
    Ok(())
}

async fn sync_command(config: AgentConfig) -> Result<()> {
    let credential_path = config.credentials_path();
    let credential = Credential::load_or_create(&credential_path)?;
    let uploader = Uploader::start(config, credential, Some(credential_path))?;
    let synced = uploader.sync_now().await;
    uploader.shutdown().await;
    println!("Synced {synced} file(s), {} remaining", uploader.status().pending_files);
    Ok(())
}

fn info_command(config: &AgentConfig) -> Result<()> {
    let credential = Credential::load(&config.credentials_path())
        .context("no credential found; run init first")?;
    let has_key = RecordSealer::load(&config.data_key_path()).is_ok();
    println!("Client ID:      {}", credential.client_id);
    println!("Registered:     {}", credential.registered);
    println!("Server:         {}", config.server_url);
    println!("Device:         {} ({})", config.device_name, config.device_type);
    println!("Data directory: {}", config.data_dir.display());
    println!("Local data:     {}", config.local_data_dir().display());
    println!("Data key:       {}", if has_key { "present" } else { "missing" });
    Ok(())
}
