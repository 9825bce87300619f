//! dsync - one-way directory mirroring.
//!
//! `dsync serve` watches a directory and broadcasts change notifications;
//! `dsync mirror` runs a bulk pass over the mirror and then applies
//! streamed events as they arrive.

use anyhow::Result;
use clap::{Parser, Subcommand};
use dsync::config::{ClientConfig, Config, ServerConfig, SyncMode};
use dsync::net::{Broadcaster, EventReceiver};
use dsync::sync::{full_sync, incremental_sync, SyncEngine};
use dsync::watch::ChangeDetector;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dsync", version, about = "One-way directory mirroring")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "DSYNC_CONFIG", default_value = "dsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the monitored directory and broadcast change notifications.
    Serve,
    /// Reconcile the local mirror and apply streamed change events.
    Mirror,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config);

    match cli.command {
        Command::Serve => serve(config.server).await,
        Command::Mirror => mirror(config.client).await,
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    if !config.monitor_dir.exists() {
        tokio::fs::create_dir_all(&config.monitor_dir).await?;
        info!("created monitor directory {}", config.monitor_dir.display());
    }

    let mut broadcaster = Broadcaster::new();
    broadcaster
        .start(&format!("{}:{}", config.bind_addr, config.port))
        .await?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut detector = ChangeDetector::new(&config.monitor_dir, events_tx);
    detector.start()?;

    info!("server started, press ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events_rx.recv() => match event {
                Some(event) => {
                    let delivered = broadcaster.broadcast(&event).await;
                    info!(
                        "{} {} -> {delivered} client(s)",
                        event.kind.as_str(),
                        event.path.display()
                    );
                }
                None => break,
            },
        }
    }

    info!("stopping server...");
    detector.stop().await;
    broadcaster.stop().await;
    Ok(())
}

async fn mirror(config: ClientConfig) -> Result<()> {
    if !config.target_dir.exists() {
        tokio::fs::create_dir_all(&config.target_dir).await?;
        info!("created target directory {}", config.target_dir.display());
    }

    let engine = Arc::new(SyncEngine::new(&config.source_root, &config.target_dir));

    let stats = match config.sync_mode {
        SyncMode::Full => full_sync(engine.clone(), config.max_workers).await?,
        SyncMode::Incremental => incremental_sync(engine.clone(), config.max_workers).await?,
    };
    if !stats.is_success() {
        warn!("{} file(s) failed during the bulk pass", stats.failed_files);
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut receiver = EventReceiver::new(format!("{}:{}", config.server_addr, config.port));
    receiver.start(events_tx);

    info!("mirror running, press ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events_rx.recv() => match event {
                Some(event) => {
                    if let Err(e) = engine.apply_event(&event).await {
                        warn!(
                            "failed to apply {} {}: {e:#}",
                            event.kind.as_str(),
                            event.path.display()
                        );
                    }
                }
                None => break,
            },
        }
    }

    info!("stopping mirror...");
    receiver.stop().await;
    Ok(())
}
