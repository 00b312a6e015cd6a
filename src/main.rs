mod cli;
mod config;
mod monitor;
mod protocol;
mod reload;
mod server;
mod tracker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use config::SceneSyncConfig;
use monitor::{Monitor, MonitorSettings};
use reload::{CommandReload, LogReload, ReloadHandler};
use server::ContentServer;
use tracker::FileTracker;

/// Id used when no explicit tracking/mapping is configured: both sides fall
/// back to their own current directory under this name.
const DEFAULT_ID: &str = "current-directory";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout belongs to the monitor console.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scenesync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SceneSyncConfig::load(Path::new("."));

    match cli.command {
        Commands::Monitor {
            host,
            port,
            track,
            sync,
        } => run_monitor(host, port, track, sync, &config).await,
        Commands::Serve {
            port,
            map,
            on_reload,
        } => run_server(port, map, on_reload, &config).await,
    }
}

async fn run_monitor(
    host: Option<String>,
    port: Option<u16>,
    track: Vec<(String, PathBuf)>,
    sync: bool,
    config: &SceneSyncConfig,
) -> anyhow::Result<()> {
    let host = host
        .or_else(|| config.monitor.host.clone())
        .context("no server host given (argument or [monitor].host in scenesync.toml)")?;
    let port = port
        .or(config.monitor.port)
        .context("no server port given (argument or [monitor].port in scenesync.toml)")?;
    let sync = sync || config.monitor.sync;

    let (mut tracker, dirty_rx) = FileTracker::new()?;

    let mut entries = track;
    for entry in &config.monitor.track {
        if !entries.iter().any(|(id, _)| id == &entry.id) {
            entries.push((entry.id.clone(), entry.path.clone()));
        }
    }
    if entries.is_empty() {
        entries.push((DEFAULT_ID.to_string(), PathBuf::from(".")));
    }

    for (id, path) in &entries {
        if tracker.track(id, path) {
            info!(%id, path = %path.display(), "tracking");
        } else {
            warn!(%id, path = %path.display(), "failed to set up tracking");
        }
    }

    let settings = MonitorSettings {
        host,
        port,
        sync_on_connect: sync,
        reconnect: config.reconnect_interval(),
    };
    Monitor::new(tracker, settings).run(dirty_rx).await
}

async fn run_server(
    port: Option<u16>,
    map: Vec<(String, PathBuf)>,
    on_reload: Option<String>,
    config: &SceneSyncConfig,
) -> anyhow::Result<()> {
    let port = port
        .or(config.server.port)
        .context("no listen port given (argument or [server].port in scenesync.toml)")?;
    let on_reload = on_reload.or_else(|| config.server.on_reload.clone());

    let mut mappings: HashMap<String, PathBuf> = map.into_iter().collect();
    for entry in &config.server.map {
        mappings
            .entry(entry.id.clone())
            .or_insert_with(|| entry.path.clone());
    }
    if mappings.is_empty() {
        mappings.insert(DEFAULT_ID.to_string(), std::env::current_dir()?);
    }
    for (id, path) in &mappings {
        info!(%id, path = %path.display(), "mapping");
    }

    let reload: Arc<dyn ReloadHandler> = match on_reload {
        Some(command) => Arc::new(CommandReload::new(command)),
        None => Arc::new(LogReload),
    };

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to listen on port {port}"))?;
    ContentServer::new(mappings, reload).run(listener).await
}
