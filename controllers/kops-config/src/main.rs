//! KopsConfig Controller
//!
//! Renders the first-boot user data of kops-managed machines into
//! bootstrap secrets:
//! - KopsConfig: per-machine bootstrap request, owner of the secret
//! - KopsControlPlane: source of the well-known control-plane addresses

mod backoff;
mod cluster_objects;
mod controller;
mod error;
mod reconciler;
mod watcher;

#[cfg(test)]
mod reconciler_test;
#[cfg(test)]
mod test_utils;

use crate::error::ControllerError;
use controller::{Controller, ControllerSettings};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube's rustls client needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting KopsConfig Controller");

    let state_store = env::var("KOPS_STATE_STORE").map_err(|_| {
        ControllerError::InvalidConfig("KOPS_STATE_STORE environment variable is required".to_string())
    })?;
    let namespace = env::var("WATCH_NAMESPACE").ok().filter(|ns| !ns.is_empty());
    let release = env::var("KOPS_RELEASE_VERSION")
        .unwrap_or_else(|_| kops_bootstrap::assets::DEFAULT_RELEASE.to_string());
    let asset_base_urls: Vec<String> = env::var("KOPS_ASSET_BASE_URLS")
        .map(|urls| {
            urls.split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let object_store_endpoint = env::var("S3_ENDPOINT").ok().filter(|e| !e.is_empty());

    info!("Configuration:");
    info!("  State store: {}", state_store);
    info!("  Namespace: {}", namespace.as_deref().unwrap_or("all namespaces"));
    info!("  nodeup release: {}", release);
    if !asset_base_urls.is_empty() {
        info!("  nodeup mirrors: {}", asset_base_urls.join(", "));
    }
    if let Some(endpoint) = &object_store_endpoint {
        info!("  Object store endpoint: {}", endpoint);
    }

    let controller = Controller::new(ControllerSettings {
        state_store,
        namespace,
        release,
        asset_base_urls,
        object_store_endpoint,
    })
    .await?;
    controller.run().await?;

    Ok(())
}
