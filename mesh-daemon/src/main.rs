//! prepper-meshd - headless mesh sync daemon.
//!
//! Runs a mesh node over iroh with mDNS discovery, backed by the SQLite
//! inventory database.
//!
//! Usage:
//! ```bash
//! prepper-meshd --config mesh.toml
//! prepper-meshd --data-dir /var/lib/prepper/mesh -v
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mesh_client::{IrohTransport, MeshConfig, MeshNode, NodeEvent, SqliteStore, SyncRound};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "prepper-meshd", version, about = "Prepper mesh sync daemon")]
struct Args {
    /// Configuration file (defaults apply if it does not exist)
    #[arg(long, short, default_value = "mesh.toml")]
    config: PathBuf,

    /// Override the node data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("prepper-meshd v{} starting", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config, args.data_dir)?;
    let store = SqliteStore::new(&config.store.database)
        .await
        .with_context(|| format!("failed to open {}", config.store.database.display()))?;

    let node = MeshNode::new(IrohTransport::new(), store, config.node_settings());
    let events = node.subscribe();
    let info = node.start().await.context("failed to start mesh node")?;

    tracing::info!("Node: {}", info.local_id);
    for address in &info.listen_addresses {
        tracing::info!("Listening on {}", address);
    }

    let mut tasks = vec![tokio::spawn(log_events(events))];
    if let Some(period) = config.sync_interval() {
        tracing::info!(?period, "periodic sync enabled");
        tasks.push(tokio::spawn(periodic_sync(node.clone(), period)));
    }

    tracing::info!("Daemon ready. Press Ctrl+C to stop.");
    shutdown_signal().await?;
    tracing::info!("Shutdown signal received...");

    for task in &tasks {
        task.abort();
    }
    node.stop().await;

    tracing::info!("Daemon stopped");
    Ok(())
}

/// Read the config file, or use defaults when it does not exist.
fn load_config(path: &Path, data_dir: Option<PathBuf>) -> Result<MeshConfig> {
    let mut config = if path.exists() {
        MeshConfig::from_file(path)?
    } else {
        tracing::info!("{} not found, using default configuration", path.display());
        MeshConfig::default()
    };
    if let Some(dir) = data_dir {
        config.node.data_dir = dir;
    }
    Ok(config)
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -v
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    const SILENCE: &[&str] = &["iroh::magicsock=error", "swarm_discovery=error"];
    for directive in SILENCE {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn log_events(mut events: broadcast::Receiver<NodeEvent>) {
    loop {
        match events.recv().await {
            Ok(NodeEvent::PeerConnected(peer)) => tracing::info!("Peer connected: {}", peer),
            Ok(NodeEvent::PeerDisconnected(peer)) => tracing::info!("Peer disconnected: {}", peer),
            Ok(NodeEvent::InventoryMerged { peer, summary }) if summary.changed() => {
                tracing::info!(
                    "Inventory from {}: {} created, {} updated",
                    peer.short(),
                    summary.created,
                    summary.updated
                );
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn periodic_sync(node: MeshNode<IrohTransport, SqliteStore>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        match node.request_sync().await {
            Ok(SyncRound::Broadcast { peers }) => tracing::debug!(peers, "periodic sync"),
            Ok(SyncRound::Skipped) => tracing::debug!("periodic sync skipped, round in progress"),
            Err(e) => tracing::warn!(error = %e, "periodic sync failed"),
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("mesh.toml"), None).unwrap();
        assert_eq!(config.node.data_dir, PathBuf::from("data/mesh"));
        assert!(config.sync_interval().is_none());
    }

    #[test]
    fn data_dir_flag_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.toml");
        std::fs::write(&path, "[node]\ndata_dir = \"from-file\"\n[sync]\ninterval_secs = 60\n")
            .unwrap();

        let config = load_config(&path, Some(PathBuf::from("from-flag"))).unwrap();
        assert_eq!(config.node.data_dir, PathBuf::from("from-flag"));
        assert_eq!(config.sync_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn invalid_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.toml");
        std::fs::write(&path, "[node\n").unwrap();
        assert!(load_config(&path, None).is_err());
    }

    #[test]
    fn args_parse() {
        let args = Args::parse_from(["prepper-meshd", "--config", "x.toml", "-vv"]);
        assert_eq!(args.config, PathBuf::from("x.toml"));
        assert_eq!(args.verbose, 2);
        assert!(args.data_dir.is_none());
    }
}
