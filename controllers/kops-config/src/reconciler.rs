//! Reconciliation logic for KopsConfig resources.
//!
//! One pass loads the cluster from the state store, collects the control
//! plane's system endpoints, runs the bootstrap pipeline and publishes the
//! rendered user data as a secret named after the KopsConfig.

use crate::backoff::FibonacciBackoff;
use crate::cluster_objects::ClusterObjects;
use crate::error::ControllerError;
use crds::{
    BOOTSTRAP_DATA_KEY, CLUSTER_NAME_LABEL, CLUSTER_SECRET_TYPE, KopsConfig, KopsConfigStatus,
    KopsControlPlane, SystemEndpointScope, SystemEndpointType,
};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kops_bootstrap::model::{
    InstanceGroup, InstanceGroupSpec, ObjectName, Role, WellKnownAddresses, WellKnownService,
};
use kops_bootstrap::pipeline::{BootstrapPipeline, BootstrapRequest, InstanceGroupSource};
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reconciles KopsConfig resources.
pub struct Reconciler {
    pipeline: BootstrapPipeline,
    objects: Box<dyn ClusterObjects>,
    /// Backoff per resource (namespace/name)
    backoff_states: Arc<Mutex<HashMap<String, FibonacciBackoff>>>,
}

impl Reconciler {
    pub fn new(pipeline: BootstrapPipeline, objects: Box<dyn ClusterObjects>) -> Self {
        Self {
            pipeline,
            objects,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reconciles one KopsConfig.
    ///
    /// Build failures are written to the status and turned into a requeue
    /// (retryable) or a wait for the next edit (not retryable). Kubernetes
    /// API failures are returned for the watcher's error policy.
    pub async fn reconcile_kops_config(&self, config: &KopsConfig) -> Result<Action, ControllerError> {
        let name = config.name_any();
        let namespace = config.namespace().unwrap_or_else(|| "default".to_string());
        let key = format!("{namespace}/{name}");

        let Some(cluster_name) = config.cluster_name() else {
            let err = ControllerError::MissingClusterLabel {
                object: key.clone(),
                label: CLUSTER_NAME_LABEL.to_string(),
            };
            warn!("KopsConfig {}: {}", key, err);
            self.record_failure(config, &namespace, &name, &err).await?;
            return Ok(Action::await_change());
        };

        let data = match self.build_bootstrap_data(config, &namespace, cluster_name).await {
            Ok(data) => data,
            Err(err @ ControllerError::Kube(_)) => return Err(err),
            Err(err) => {
                error!("Failed to build bootstrap data for KopsConfig {}: {}", key, err);
                if !self.record_failure(config, &namespace, &name, &err).await? {
                    return Ok(Action::await_change());
                }
                return Ok(if err.is_retryable() {
                    Action::requeue(self.next_backoff(&key))
                } else {
                    Action::await_change()
                });
            }
        };

        let secret = bootstrap_secret(config, &namespace, cluster_name, data)?;
        self.store_bootstrap_data(&key, &namespace, secret).await?;

        let desired = KopsConfigStatus {
            ready: true,
            data_secret_name: Some(name.clone()),
            error: None,
            last_reconciled: Some(chrono::Utc::now()),
        };
        self.update_status(config, &namespace, &name, desired).await?;
        self.forget_backoff(&key);
        info!("KopsConfig {} is ready", key);
        Ok(Action::await_change())
    }

    /// Runs the bootstrap pipeline for `config`.
    pub async fn build_bootstrap_data(
        &self,
        config: &KopsConfig,
        namespace: &str,
        cluster_label: &str,
    ) -> Result<Vec<u8>, ControllerError> {
        let (cp_namespace, cp_name) = match &config.spec.control_plane_ref {
            Some(r) => (r.namespace.as_deref().unwrap_or(namespace), r.name.as_str()),
            None => (namespace, cluster_label),
        };

        let control_plane = self.objects.get_control_plane(cp_namespace, cp_name).await?;
        let (cluster_name, well_known_addresses) = match &control_plane {
            Some(cp) => (
                cp.spec.cluster_name.as_deref().unwrap_or(cluster_label),
                well_known_addresses(cp),
            ),
            None => {
                debug!(
                    "KopsControlPlane {}/{} not found; building without well-known addresses",
                    cp_namespace, cp_name
                );
                (cluster_label, WellKnownAddresses::default())
            }
        };

        let request = BootstrapRequest {
            cluster_name: cluster_name.to_string(),
            instance_group: instance_group_source(config)?,
            well_known_addresses,
        };
        Ok(self.pipeline.build(&request).await?)
    }

    /// Creates the secret, or replaces it when its contents differ.
    async fn store_bootstrap_data(&self, key: &str, namespace: &str, mut secret: Secret) -> Result<(), ControllerError> {
        let name = secret.name_any();
        match self.objects.get_secret(namespace, &name).await? {
            None => {
                self.objects.create_secret(namespace, &secret).await?;
                info!("Created bootstrap data secret {}/{} for KopsConfig {}", namespace, name, key);
            }
            Some(existing) if secret_matches(&existing, &secret) => {
                debug!("Bootstrap data secret {}/{} is up to date", namespace, name);
            }
            Some(existing) => {
                warn!(
                    "Bootstrap data secret {}/{} differs from the rendered data; replacing it",
                    namespace, name
                );
                secret.metadata.resource_version = existing.metadata.resource_version;
                self.objects.replace_secret(namespace, &secret).await?;
            }
        }
        Ok(())
    }

    /// Writes `err` to the status. Returns false when the KopsConfig is gone.
    async fn record_failure(
        &self,
        config: &KopsConfig,
        namespace: &str,
        name: &str,
        err: &ControllerError,
    ) -> Result<bool, ControllerError> {
        // The secret from an earlier success stays, but it no longer reflects
        // the current spec and state store
        let mut desired = config.status.clone().unwrap_or_default();
        desired.ready = false;
        desired.error = Some(err.to_string());
        desired.last_reconciled = Some(chrono::Utc::now());
        self.update_status(config, namespace, name, desired).await
    }

    async fn update_status(
        &self,
        config: &KopsConfig,
        namespace: &str,
        name: &str,
        desired: KopsConfigStatus,
    ) -> Result<bool, ControllerError> {
        // lastReconciled alone never triggers a patch, or every patch would
        // cause another reconcile
        if !status_needs_update(config.status.as_ref(), &desired) {
            return Ok(true);
        }
        if !self.objects.patch_config_status(namespace, name, &desired).await? {
            debug!("KopsConfig {}/{} was deleted before its status was written", namespace, name);
            self.forget_backoff(&format!("{namespace}/{name}"));
            return Ok(false);
        }
        Ok(true)
    }

    /// Next retry delay for a resource.
    pub fn next_backoff(&self, resource_key: &str) -> Duration {
        match self.backoff_states.lock() {
            Ok(mut states) => states.entry(resource_key.to_string()).or_default().next_backoff(),
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                Duration::from_secs(60)
            }
        }
    }

    /// Drops the retry state of a resource that succeeded or was deleted.
    fn forget_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(resource_key);
        }
    }

    #[cfg(test)]
    pub fn tracks_backoff(&self, resource_key: &str) -> bool {
        self.backoff_states
            .lock()
            .map(|states| states.contains_key(resource_key))
            .unwrap_or(false)
    }
}

/// Maps the control plane's system endpoints to well-known addresses.
pub fn well_known_addresses(control_plane: &KopsControlPlane) -> WellKnownAddresses {
    let mut wka = WellKnownAddresses::default();
    let Some(status) = &control_plane.status else {
        return wka;
    };
    for endpoint in &status.system_endpoints {
        let service = match (endpoint.endpoint_type, endpoint.scope) {
            (SystemEndpointType::KopsController, _) => WellKnownService::KopsController,
            (SystemEndpointType::KubeApiServer, SystemEndpointScope::Internal) => {
                WellKnownService::KubeApiServerInternal
            }
            (SystemEndpointType::KubeApiServer, SystemEndpointScope::External) => {
                WellKnownService::KubeApiServerExternal
            }
        };
        wka.add(service, endpoint.endpoint.clone());
    }
    wka
}

/// Embedded group first, then the named group in the state store.
pub fn instance_group_source(config: &KopsConfig) -> Result<InstanceGroupSource, ControllerError> {
    if let Some(embedded) = &config.spec.instance_group {
        let role: Role = serde_json::from_value(serde_json::Value::String(embedded.role.clone()))
            .map_err(|_| ControllerError::InvalidConfig(format!("unknown instance group role {:?}", embedded.role)))?;
        return Ok(InstanceGroupSource::Embedded(InstanceGroup {
            metadata: ObjectName {
                name: embedded.name.clone().unwrap_or_else(|| config.name_any()),
            },
            spec: InstanceGroupSpec {
                role: Some(role),
                machine_type: embedded.machine_type.clone(),
                compress_user_data: embedded.compress_user_data,
                ..Default::default()
            },
        }));
    }
    match &config.spec.instance_group_name {
        Some(name) if !name.is_empty() => Ok(InstanceGroupSource::Named(name.clone())),
        _ => Err(ControllerError::InvalidConfig(
            "spec.instanceGroup or spec.instanceGroupName is required".to_string(),
        )),
    }
}

/// The secret carrying `data`, labeled with the cluster and owned by `config`.
pub fn bootstrap_secret(
    config: &KopsConfig,
    namespace: &str,
    cluster_name: &str,
    data: Vec<u8>,
) -> Result<Secret, ControllerError> {
    let owner = config.controller_owner_ref(&()).ok_or_else(|| {
        ControllerError::InvalidConfig(format!("KopsConfig {}/{} has no uid", namespace, config.name_any()))
    })?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(config.name_any()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string())])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(BOOTSTRAP_DATA_KEY.to_string(), ByteString(data))])),
        type_: Some(CLUSTER_SECRET_TYPE.to_string()),
        ..Default::default()
    })
}

/// Byte-exact data comparison plus labels, owner and type.
pub fn secret_matches(existing: &Secret, desired: &Secret) -> bool {
    let value = |s: &Secret| s.data.as_ref().and_then(|d| d.get(BOOTSTRAP_DATA_KEY)).map(|b| b.0.clone());
    let label = |s: &Secret| {
        s.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(CLUSTER_NAME_LABEL))
            .cloned()
    };
    value(existing) == value(desired)
        && label(existing) == label(desired)
        && existing.metadata.owner_references == desired.metadata.owner_references
        && existing.type_ == desired.type_
}

fn status_needs_update(current: Option<&KopsConfigStatus>, desired: &KopsConfigStatus) -> bool {
    match current {
        None => true,
        Some(current) => {
            current.ready != desired.ready
                || current.data_secret_name != desired.data_secret_name
                || current.error != desired.error
        }
    }
}
