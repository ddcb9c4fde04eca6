//! KopsControlPlane CRD
//!
//! Control plane of a kops-managed cluster. Its status publishes the
//! system endpoints new machines use to find the control plane.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "KopsControlPlane",
    namespaced,
    status = "KopsControlPlaneStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KopsControlPlaneSpec {
    /// Kops cluster name in the state store (defaults to the object name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KopsControlPlaneStatus {
    /// Endpoints of the control-plane services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_endpoints: Vec<SystemEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemEndpoint {
    #[serde(rename = "type")]
    pub endpoint_type: SystemEndpointType,

    /// DNS name or IP address
    pub endpoint: String,

    #[serde(default)]
    pub scope: SystemEndpointScope,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum SystemEndpointType {
    #[serde(rename = "kops-controller")]
    KopsController,
    #[serde(rename = "kube-apiserver")]
    KubeApiServer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SystemEndpointScope {
    #[default]
    Internal,
    External,
}
