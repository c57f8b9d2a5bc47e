use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracker_collector::{app, AppState, CollectorConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Secure Tracker collector", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept device logins and uploads
    Serve {
        /// JSON config file; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        bind: Option<String>,
        /// Token lifetime in seconds
        #[arg(long)]
        token_ttl: Option<u64>,
        /// Hex data key shared with agents, enables decryption of records
        #[arg(long)]
        data_key_file: Option<PathBuf>,
        /// Append security events to this JSONL file
        #[arg(long)]
        audit_log: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            bind,
            token_ttl,
            data_key_file,
            audit_log,
        } => {
            let mut cfg = match config {
                Some(path) => CollectorConfig::from_file(&path)?,
                None => CollectorConfig::default(),
            };
            if let Some(bind) = bind {
                cfg.bind = bind;
            }
            if let Some(ttl) = token_ttl {
                cfg.token_ttl_secs = ttl;
            }
            if data_key_file.is_some() {
                cfg.data_key_file = data_key_file;
            }
            if audit_log.is_some() {
                cfg.audit_log = audit_log;
            }
            serve(cfg).await
        }
    }
}

async fn serve(config: CollectorConfig) -> Result<()> {
    let bind = config.bind.clone();
    let state = AppState::new(config)?;

    let pruner = {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                state.prune();
            }
        })
    };

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(addr = %listener.local_addr()?, decrypting = state.config().data_key_file.is_some(), "collector listening");
    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    pruner.abort();
    let stats = state.stats();
    info!(
        logins = stats.logins,
        uploads = stats.uploads,
        duplicates = stats.duplicates,
        rejections = stats.rejections,
        "collector stopped"
    );
    Ok(())
}
