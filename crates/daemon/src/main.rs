//! TermHub Daemon
//!
//! Headless service for shared remote terminal sessions.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use daemon::config::Config;
use daemon::delivery::ChannelSink;
use daemon::session::TerminalSessionManager;
use daemon::store::{MemoryStore, RedisStore, Store};
use daemon::transport::{SshDialer, TransportPool};

/// TermHub daemon - shared remote terminal session service.
#[derive(Parser, Debug)]
#[command(name = "termhub-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("TermHub daemon starting...");

    // The durable cache is a convenience: when it is unreachable the daemon
    // runs on in-memory metadata alone.
    let store = if config.cache.enabled {
        match RedisStore::connect(&config.cache.url, config.session.idle_timeout_secs).await {
            Ok(store) => Store::Redis(store),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "durable cache unavailable; running with in-memory metadata only"
                );
                Store::Memory(MemoryStore::new())
            }
        }
    } else {
        tracing::info!("durable cache disabled; running with in-memory metadata only");
        Store::Memory(MemoryStore::new())
    };

    let pool = Arc::new(TransportPool::new(
        SshDialer::new(),
        config.session.max_transports,
    ));
    let sink = Arc::new(ChannelSink::new());
    let manager = Arc::new(TerminalSessionManager::new(
        pool,
        Arc::new(store),
        sink,
        config.session.clone(),
        config.shell.clone(),
    ));

    // Restored records are discoverable metadata only; their transports are
    // gone and each session must be recreated to stream again.
    let restored = manager.restore_on_startup().await;
    if restored > 0 {
        tracing::info!(count = restored, "discovered sessions from a previous run");
    }

    manager.start().await;
    tracing::info!("TermHub daemon ready");

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await;
    tracing::info!("Received shutdown signal");

    manager.shutdown().await;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}
