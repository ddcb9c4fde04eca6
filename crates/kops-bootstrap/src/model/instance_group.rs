//! Instance groups: sets of machines sharing a role and template.

use super::cluster::ObjectName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An instance group as stored under `<base>/<cluster>/instancegroup/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceGroup {
    /// Object metadata
    pub metadata: ObjectName,

    /// Group template
    pub spec: InstanceGroupSpec,
}

/// Machine template shared by every member of the group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupSpec {
    /// Role; must be set before the group enters the pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// Machine type, e.g. "t3.medium"
    #[serde(default)]
    pub machine_type: String,

    /// Machine image
    #[serde(default)]
    pub image: String,

    /// Availability zones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,

    /// Minimum group size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u32>,

    /// Maximum group size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,

    /// Gzip + base64 the boot script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress_user_data: Option<bool>,

    /// Extra cloud-init parts appended after the boot script
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_user_data: Vec<UserData>,
}

/// One additional user-data part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserData {
    /// Part file name
    pub name: String,

    /// MIME type, e.g. "text/x-shellscript"
    #[serde(rename = "type")]
    pub content_type: String,

    /// Part body
    pub content: String,
}

/// Role of the machines in a group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Role {
    /// Control-plane node running etcd and the API server
    #[serde(alias = "Master", alias = "controlplane")]
    ControlPlane,
    /// Worker node
    #[serde(alias = "node")]
    Node,
    /// API server without etcd
    #[serde(rename = "APIServer", alias = "APIServerOnly", alias = "apiserver")]
    ApiServerOnly,
    /// SSH jump host
    #[serde(alias = "bastion")]
    Bastion,
}

impl Role {
    /// Roles that discover the control plane through well-known addresses.
    #[must_use]
    pub fn needs_well_known_addresses(self) -> bool {
        matches!(self, Role::Node | Role::ApiServerOnly)
    }

    /// Name written into the boot configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::ControlPlane => "ControlPlane",
            Role::Node => "Node",
            Role::ApiServerOnly => "APIServer",
            Role::Bastion => "Bastion",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl InstanceGroup {
    /// Group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Whether the boot script should be compressed.
    #[must_use]
    pub fn compress_user_data(&self) -> bool {
        self.spec.compress_user_data.unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_instance_group(role: Role) -> InstanceGroup {
        InstanceGroup {
            metadata: ObjectName { name: "nodes".to_string() },
            spec: InstanceGroupSpec {
                role: Some(role),
                machine_type: "t3.medium".to_string(),
                image: "ubuntu-22.04".to_string(),
                zones: vec!["us-east-1a".to_string()],
                min_size: Some(1),
                max_size: Some(3),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_role_aliases() {
        let role: Role = serde_yaml::from_str("Master").expect("alias");
        assert_eq!(role, Role::ControlPlane);
        let role: Role = serde_yaml::from_str("APIServerOnly").expect("alias");
        assert_eq!(role, Role::ApiServerOnly);
        assert_eq!(serde_yaml::to_string(&Role::ApiServerOnly).expect("ser").trim(), "APIServer");
    }

    #[test]
    fn test_needs_well_known_addresses() {
        assert!(Role::Node.needs_well_known_addresses());
        assert!(Role::ApiServerOnly.needs_well_known_addresses());
        assert!(!Role::ControlPlane.needs_well_known_addresses());
        assert!(!Role::Bastion.needs_well_known_addresses());
    }
}
