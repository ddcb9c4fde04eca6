//! Kubernetes object access used by the reconciler.
//!
//! The trait keeps the reconciler testable without an API server; the
//! in-memory implementation lives in `test_utils`.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{KopsConfig, KopsConfigStatus, KopsControlPlane};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;

#[async_trait]
pub trait ClusterObjects: Send + Sync {
    /// The KopsControlPlane named `name`, or `None` when it does not exist.
    async fn get_control_plane(&self, namespace: &str, name: &str) -> Result<Option<KopsControlPlane>, ControllerError>;

    /// The secret named `name`, or `None` when it does not exist.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ControllerError>;

    /// Creates a secret; fails if one with the same name exists.
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ControllerError>;

    /// Replaces a secret; `secret` must carry the current resourceVersion.
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ControllerError>;

    /// Merge-patches the status subresource. `Ok(false)` when the object is gone.
    async fn patch_config_status(
        &self,
        namespace: &str,
        name: &str,
        status: &KopsConfigStatus,
    ) -> Result<bool, ControllerError>;
}

/// [`ClusterObjects`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterObjects {
    client: Client,
}

impl KubeClusterObjects {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterObjects for KubeClusterObjects {
    async fn get_control_plane(&self, namespace: &str, name: &str) -> Result<Option<KopsControlPlane>, ControllerError> {
        let api: Api<KopsControlPlane> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ControllerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ControllerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ControllerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidConfig("secret has no name".to_string()))?;
        api.replace(name, &PostParams::default(), secret).await?;
        Ok(())
    }

    async fn patch_config_status(
        &self,
        namespace: &str,
        name: &str,
        status: &KopsConfigStatus,
    ) -> Result<bool, ControllerError> {
        let api: Api<KopsConfig> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = json!({ "status": status });
        match api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(ControllerError::Kube(e)),
        }
    }
}
