//! KopsConfig CRD
//!
//! Per-machine bootstrap request. The controller renders the machine's
//! first-boot user data into a secret of the same name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label naming the cluster an object belongs to.
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Type of the bootstrap data secret.
pub const CLUSTER_SECRET_TYPE: &str = "cluster.x-k8s.io/secret";

/// Data key holding the rendered user data.
pub const BOOTSTRAP_DATA_KEY: &str = "value";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "bootstrap.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "KopsConfig",
    namespaced,
    status = "KopsConfigStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".status.dataSecretName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KopsConfigSpec {
    /// Instance group stored in the kops state store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_group_name: Option<String>,

    /// Instance group given inline; takes precedence over `instanceGroupName`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_group: Option<EmbeddedInstanceGroup>,

    /// KopsControlPlane publishing the well-known addresses
    /// (defaults to the object named after the cluster label, same namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<ControlPlaneRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedInstanceGroup {
    /// Group name (defaults to the KopsConfig name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Role: ControlPlane, Node, APIServer or Bastion
    pub role: String,

    /// Machine type, e.g. "t3.medium"
    #[serde(default)]
    pub machine_type: String,

    /// Gzip + base64 the boot script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress_user_data: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneRef {
    pub name: String,

    /// Namespace (defaults to same namespace as the KopsConfig)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KopsConfigStatus {
    /// Bootstrap data secret is available
    #[serde(default)]
    pub ready: bool,

    /// Name of the secret holding the user data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,

    /// Message of the last failed build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}

impl KopsConfig {
    /// Value of the cluster-name label, if set and non-empty.
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(CLUSTER_NAME_LABEL))
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}
