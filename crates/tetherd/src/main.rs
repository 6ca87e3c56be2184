//! tetherd — peer discovery and TCP bridging daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use tether_core::config::TetherConfig;
use tether_services::{ConnectionManager, StartOptions};

mod console;
mod lan;
mod sink;

use lan::{LanSettings, LanTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    let config = match TetherConfig::locate() {
        Some(path) => TetherConfig::load_from(&path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            TetherConfig::default()
        }),
        None => {
            tracing::warn!("no config location in the environment, using defaults");
            let mut config = TetherConfig::default();
            config.apply_overrides(|key| std::env::var(key).ok());
            config
        }
    };

    let interface = std::env::args()
        .nth(1)
        .or_else(|| Some(config.network.interface.clone()).filter(|i| !i.is_empty()))
        .unwrap_or_else(|| "eth0".to_string());
    let interface_index = lan::presence::if_index(&interface)?;

    let settings = LanSettings::from_config(&config, interface_index);
    tracing::info!(
        interface,
        interface_index,
        peer_id = %settings.peer_id,
        peer_name = %settings.peer_name,
        "tetherd starting"
    );

    let transport = Arc::new(LanTransport::new(settings));
    let (manager, manager_task) = ConnectionManager::spawn(
        transport.clone(),
        Arc::new(sink::JsonLinesSink),
        config.bridge.clone(),
    );

    let start = StartOptions {
        server_port: config.network.server_port,
        advertise: config.network.advertise,
    };
    manager
        .start(start)
        .await
        .context("failed to start connection manager")?;
    tracing::info!(peer_id = transport.peer_id(), "discovery running");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let console_task = tokio::spawn(
        console::Console::new(manager.clone(), start, shutdown_tx.subscribe()).run(),
    );

    let session_printer = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let sessions = manager.sessions().await;
                tracing::info!(count = sessions.len(), "session table snapshot");
                for s in sessions {
                    tracing::info!(
                        session = %s.id,
                        peer_id = %s.peer.peer_id,
                        direction = ?s.direction,
                        port = s.local_port,
                        state = ?s.state,
                        "  session"
                    );
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()    => tracing::info!("shutting down"),
        r = console_task          => tracing::error!("console exited: {:?}", r),
        r = session_printer       => tracing::error!("session printer exited: {:?}", r),
    }

    manager.shutdown().await;
    if let Err(e) = manager_task.await {
        tracing::error!(error = %e, "connection manager task failed");
    }

    Ok(())
}
