//! Kubernetes resource watchers.
//!
//! KopsConfig objects are reconciled through `kube_runtime::Controller`,
//! which reconnects dropped watches and schedules requeues. Changes to the
//! bootstrap secrets owned by a KopsConfig also trigger its reconciliation,
//! so a deleted or edited secret is restored.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::KopsConfig;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, ResourceExt};
use kube_runtime::{Controller, controller::{Action, Config as ControllerConfig}, watcher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Generic watcher helper around `kube_runtime::Controller`.
///
/// Failed reconciliations are requeued with the reconciler's per-resource
/// Fibonacci backoff.
async fn watch_resource<K, F>(
    api: Api<K>,
    secrets: Api<Secret>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    resource_name: &'static str,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(Arc<Reconciler>, Arc<K>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Action, ControllerError>> + Send>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    info!("Starting {} watcher", resource_name);

    let error_policy = |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any());
        let delay = ctx.next_backoff(&key);
        error!(
            "Reconciliation error for {} {}: {} (retrying in {:?})",
            resource_name, key, error, delay
        );
        Action::requeue(delay)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            debug!("Reconciling {} {}", resource_name, obj.name_any());
            reconcile_fn(ctx, obj).await
        }
    };

    // Debounce batches bursts of status updates into one reconcile
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(5))
        .concurrency(3);

    Controller::new(api, watcher::Config::default())
        .owns(secrets, watcher::Config::default())
        .with_config(controller_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {} {}", resource_name, obj.name),
                Err(e) => error!("Controller error for {}: {}", resource_name, e),
            }
        })
        .await;

    Ok(())
}

/// Watches KopsConfig resources and their bootstrap secrets.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    kops_config_api: Api<KopsConfig>,
    secret_api: Api<Secret>,
}

impl Watcher {
    pub fn new(reconciler: Arc<Reconciler>, kops_config_api: Api<KopsConfig>, secret_api: Api<Secret>) -> Self {
        Self {
            reconciler,
            kops_config_api,
            secret_api,
        }
    }

    /// Runs until the watch stream ends.
    pub async fn watch_kops_configs(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.kops_config_api.clone(),
            self.secret_api.clone(),
            self.reconciler.clone(),
            |reconciler, config: Arc<KopsConfig>| {
                Box::pin(async move { reconciler.reconcile_kops_config(&config).await })
            },
            "KopsConfig",
        )
        .await
    }
}
