//! IPAM Server
//!
//! Hosts one allocator peer: loads its configuration from the environment,
//! restores persisted state, serves the HTTP API and gossips with the other
//! configured peers.

use anyhow::Context;
use ipam::{Allocator, AllocatorHandle, FileDb, SystemClock};
use ipam_server::{AppState, HttpGossip, Metrics, ServerConfig, router, spawn_periodic_gossip};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting IPAM server");

    let config = ServerConfig::from_env()?;

    info!("Configuration:");
    info!("  Peer: {} ({})", config.peer_name, config.nickname);
    info!("  Universe: {}", config.universe);
    info!("  Default subnet: {}", config.default_subnet);
    info!("  Consensus peers: {}{}", config.consensus_peers, if config.observer { " (observer)" } else { "" });
    info!("  Gossip peers: {}", config.peers.len());
    info!("  Database: {}", config.db_dir.display());
    info!("  Listen: {}", config.listen_addr);

    let db = FileDb::open(config.db_dir.clone())
        .with_context(|| format!("opening database at {}", config.db_dir.display()))?;
    let (transport, delivery) = HttpGossip::spawn(config.peer_name.clone(), config.peers.clone())?;

    let mut allocator = Allocator::new(
        config.allocator_config(),
        transport.clone(),
        Arc::new(db),
        Arc::new(SystemClock),
    );
    allocator.start().context("restoring allocator state")?;
    let (handle, actor) = AllocatorHandle::spawn(allocator);
    let gossip = spawn_periodic_gossip(handle.clone(), transport, config.gossip_interval);

    let state = Arc::new(AppState {
        handle: handle.clone(),
        universe: config.universe,
        default_subnet: config.default_subnet,
        metrics: Metrics::new()?,
    });
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("Listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
        })
        .await?;

    // hand our ranges to another peer before exiting
    if let Err(e) = handle.shutdown().await {
        warn!("Allocator shutdown failed: {}", e);
    }
    gossip.abort();
    drop(handle);
    let _ = actor.await;
    // the delivery task drains queued gossip once the allocator is gone
    if tokio::time::timeout(SHUTDOWN_DRAIN, delivery).await.is_err() {
        warn!("Gave up delivering gossip after {:?}", SHUTDOWN_DRAIN);
    }

    info!("IPAM server stopped");
    Ok(())
}
