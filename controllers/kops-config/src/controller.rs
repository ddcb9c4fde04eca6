//! Main controller implementation.
//!
//! Wires the Kubernetes client, the bootstrap pipeline and the KopsConfig
//! watcher together.

use crate::cluster_objects::KubeClusterObjects;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use crds::KopsConfig;
use k8s_openapi::api::core::v1::Secret;
use kops_bootstrap::AssetResolver;
use kops_bootstrap::assets::{AssetDefaults, RemoteHashSource};
use kops_bootstrap::pipeline::BootstrapPipeline;
use kops_bootstrap::vfs::VfsContext;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Settings read from the environment.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Base path of the kops state store, e.g. `s3://...` or `file:///srv/kops`
    pub state_store: String,
    /// Namespace to watch; all namespaces when unset
    pub namespace: Option<String>,
    /// nodeup release used for the default mirrors
    pub release: String,
    /// Overrides the default nodeup mirrors when non-empty
    pub asset_base_urls: Vec<String>,
    /// S3-compatible endpoint serving `s3://` and `do://` state stores
    pub object_store_endpoint: Option<String>,
}

/// KopsConfig controller.
pub struct Controller {
    kops_config_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates the controller and starts its watcher.
    pub async fn new(settings: ControllerSettings) -> Result<Self, ControllerError> {
        info!("Initializing KopsConfig Controller");

        let kube_client = Client::try_default().await?;
        let pipeline = build_pipeline(&settings)?;

        let (kops_config_api, secret_api): (Api<KopsConfig>, Api<Secret>) = match settings.namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(kube_client.clone(), ns),
                Api::namespaced(kube_client.clone(), ns),
            ),
            None => (Api::all(kube_client.clone()), Api::all(kube_client.clone())),
        };

        let reconciler = Arc::new(Reconciler::new(
            pipeline,
            Box::new(KubeClusterObjects::new(kube_client)),
        ));
        let watcher = Watcher::new(reconciler, kops_config_api, secret_api);
        let kops_config_watcher = tokio::spawn(async move { watcher.watch_kops_configs().await });

        Ok(Self { kops_config_watcher })
    }

    /// Runs until the watcher exits.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("KopsConfig Controller running");
        self.kops_config_watcher
            .await
            .map_err(|e| ControllerError::Watch(format!("KopsConfig watcher panicked: {}", e)))?
            .map_err(|e| ControllerError::Watch(format!("KopsConfig watcher error: {}", e)))?;
        Ok(())
    }
}

fn build_pipeline(settings: &ControllerSettings) -> Result<BootstrapPipeline, ControllerError> {
    let mut vfs = VfsContext::with_default_stores()
        .map_err(|e| ControllerError::InvalidConfig(format!("state store access: {e}")))?;
    if let Some(endpoint) = settings.object_store_endpoint.as_deref() {
        for scheme in ["s3", "do"] {
            vfs = vfs
                .with_object_endpoint(scheme, endpoint)
                .map_err(|e| ControllerError::InvalidConfig(format!("object store endpoint {endpoint}: {e}")))?;
        }
    }

    let mut defaults = AssetDefaults::for_release(&settings.release);
    if !settings.asset_base_urls.is_empty() {
        defaults.base_urls = settings.asset_base_urls.clone();
    }
    let resolver = AssetResolver::new(defaults, Box::new(RemoteHashSource::new(vfs.clone())));

    let pipeline = BootstrapPipeline::new(vfs, &settings.state_store)
        .map_err(|e| ControllerError::InvalidConfig(format!("KOPS_STATE_STORE {}: {e}", settings.state_store)))?
        .with_asset_resolver(resolver);
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(state_store: &str, endpoint: Option<&str>) -> ControllerSettings {
        ControllerSettings {
            state_store: state_store.to_string(),
            namespace: None,
            release: kops_bootstrap::assets::DEFAULT_RELEASE.to_string(),
            asset_base_urls: Vec::new(),
            object_store_endpoint: endpoint.map(str::to_string),
        }
    }

    #[test]
    fn test_object_store_state_stores() {
        assert!(build_pipeline(&settings("s3://kops-state", None)).is_ok());
        assert!(build_pipeline(&settings("gs://kops-state", None)).is_ok());
        assert!(build_pipeline(&settings("do://kops-state", Some("https://nyc3.digitaloceanspaces.com"))).is_ok());
    }

    #[test]
    fn test_unserved_state_store_is_invalid_config() {
        let err = build_pipeline(&settings("do://kops-state", None)).expect_err("no do endpoint");
        assert!(matches!(&err, ControllerError::InvalidConfig(msg) if msg.contains("do://kops-state")));
        assert!(!err.is_retryable());

        assert!(matches!(
            build_pipeline(&settings("/srv/kops", None)),
            Err(ControllerError::InvalidConfig(_))
        ));
    }
}
