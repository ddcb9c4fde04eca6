//! Cluster specification.

use crate::config::ConfigError;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A cluster object as stored under `<base>/<cluster-name>/config`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Object metadata (only the name is used)
    pub metadata: ObjectName,

    /// Desired cluster state
    pub spec: ClusterSpec,
}

/// Minimal object metadata carried by state-store documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ObjectName {
    /// Object name
    pub name: String,
}

/// Declarative description of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Kubernetes version (semantic version string, e.g. "1.28.3")
    pub kubernetes_version: String,

    /// Cloud provider tag
    pub cloud_provider: CloudProvider,

    /// Pod, service and DNS settings
    pub networking: NetworkingSpec,

    /// Asset mirror overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<AssetsSpec>,

    /// Whether an encryption-at-rest config is installed on control-plane nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_config: Option<bool>,

    /// Per-subnet metadata
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SubnetSpec>,
}

/// Supported cloud providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Amazon Web Services
    Aws,
    /// Google Compute Engine
    Gce,
    /// Microsoft Azure
    Azure,
    /// DigitalOcean
    DigitalOcean,
    /// Hetzner Cloud
    Hetzner,
    /// OpenStack
    Openstack,
    /// Scaleway
    Scaleway,
    /// Bare metal (no cloud integration)
    Metal,
}

impl CloudProvider {
    /// Tag passed to nodeup via `--cloud-provider`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Gce => "gce",
            CloudProvider::Azure => "azure",
            CloudProvider::DigitalOcean => "digitalocean",
            CloudProvider::Hetzner => "hetzner",
            CloudProvider::Openstack => "openstack",
            CloudProvider::Scaleway => "scaleway",
            CloudProvider::Metal => "metal",
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Networking ranges and DNS settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSpec {
    /// Pod CIDRs (at least one)
    #[serde(default)]
    pub pod_cidrs: Vec<String>,

    /// Service CIDRs (at least one)
    #[serde(default)]
    pub service_cidrs: Vec<String>,

    /// Cluster DNS domain, e.g. "cluster.local"
    #[serde(default)]
    pub dns_domain: String,

    /// Egress proxy used by nodes during bootstrap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_proxy: Option<EgressProxySpec>,
}

/// HTTP proxy configuration for node egress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EgressProxySpec {
    /// Proxy host, with or without a scheme
    pub http_proxy: String,

    /// Proxy port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Comma-separated hosts/domains that bypass the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
}

/// Asset mirror overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssetsSpec {
    /// Base URL replacing the compiled-in file mirrors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_repository: Option<String>,

    /// Additional mirrors tried after the primary one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,

    /// Pinned hashes keyed by object path (e.g. "amd64/nodeup")
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hashes: BTreeMap<String, String>,
}

/// Metadata for one cluster subnet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Subnet name
    pub name: String,

    /// Availability zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    /// Subnet CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,

    /// Subnet type (Public, Private, Utility)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub subnet_type: Option<String>,
}

impl Cluster {
    /// Returns the cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Checks the invariants the pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCluster`] naming the first violated field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let spec = &self.spec;
        if self.metadata.name.trim().is_empty() {
            return Err(ConfigError::InvalidCluster("metadata.name must be set".to_string()));
        }
        if !is_semver(&spec.kubernetes_version) {
            return Err(ConfigError::InvalidCluster(format!(
                "spec.kubernetesVersion {:?} is not a semantic version",
                spec.kubernetes_version
            )));
        }
        if spec.networking.pod_cidrs.is_empty() {
            return Err(ConfigError::InvalidCluster(
                "spec.networking.podCidrs needs at least one CIDR".to_string(),
            ));
        }
        if spec.networking.service_cidrs.is_empty() {
            return Err(ConfigError::InvalidCluster(
                "spec.networking.serviceCidrs needs at least one CIDR".to_string(),
            ));
        }
        for cidr in spec.networking.pod_cidrs.iter().chain(&spec.networking.service_cidrs) {
            cidr.parse::<IpNetwork>().map_err(|e| {
                ConfigError::InvalidCluster(format!("invalid CIDR {cidr:?}: {e}"))
            })?;
        }
        if spec.networking.dns_domain.trim().is_empty() {
            return Err(ConfigError::InvalidCluster(
                "spec.networking.dnsDomain must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns true when encryption-at-rest is enabled.
    #[must_use]
    pub fn encryption_enabled(&self) -> bool {
        self.spec.encryption_config.unwrap_or(false)
    }
}

/// Accepts `MAJOR.MINOR.PATCH` with an optional leading `v` and an optional
/// pre-release/build suffix.
fn is_semver(version: &str) -> bool {
    let version = version.strip_prefix('v').unwrap_or(version);
    let core = version
        .split(['-', '+'])
        .next()
        .unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
