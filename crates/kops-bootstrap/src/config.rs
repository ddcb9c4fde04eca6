//! Boot configuration assembly.
//!
//! [`ConfigBuilder::build`] is deterministic: equal inputs produce equal
//! [`BootConfig`] values, and every map in the type is ordered so the YAML
//! encoding is byte-stable too.

use crate::model::{
    CloudProvider, Cluster, InstanceGroup, KUBERNETES_CA, Keyset, Role, WellKnownAddresses,
    WellKnownService,
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Port kops-controller serves node configuration on.
pub const CONFIG_SERVER_PORT: u16 = 3988;

/// Keysets by CA name.
pub type Keysets = BTreeMap<String, Keyset>;

/// Errors raised while building the boot configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required CA keyset is absent from the state store
    #[error("keyset {0:?} not found")]
    MissingKeyset(String),

    /// The keyset names no usable primary certificate
    #[error("keyset {0:?} has no primary certificate")]
    NoPrimary(String),

    /// A node needs a control-plane address that is not known yet
    #[error("no endpoint registered for well-known service {0:?}")]
    MissingEndpoint(String),

    /// The instance group spec leaves `role` empty
    #[error("instance group {0:?} has no role set")]
    RoleNotSet(String),

    /// Cluster fields the boot config depends on are unusable
    #[error("invalid cluster spec: {0}")]
    InvalidCluster(String),

    /// Encryption at rest is on but its secret was not supplied
    #[error("encryption config is enabled but the encryptionconfig secret is missing")]
    MissingEncryptionSecret,

    /// YAML encoding of the boot config failed
    #[error("failed to serialize boot configuration: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

/// Where non-control-plane nodes fetch their configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigServer {
    /// Base URL of kops-controller
    pub server: String,

    /// CA bundle used to verify the server
    pub ca_certificates: String,
}

/// The payload handed to `nodeup` on first boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootConfig {
    /// Cloud the machine runs on
    pub cloud_provider: CloudProvider,
    /// Kubernetes version from the cluster spec
    pub kubernetes_version: String,
    /// Fully qualified cluster name
    pub cluster_name: String,
    /// Instance group the machine belongs to
    pub instance_group_name: String,
    /// Role of that instance group
    pub instance_group_role: Role,
    /// Control-plane endpoints known at render time
    pub well_known_addresses: WellKnownAddresses,
    /// PEM of the primary kubernetes-ca certificate
    pub ca_certificates: String,
    /// kops-controller to fetch the rest of the config from; nodes only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_server: Option<ConfigServer>,
    /// Digest of the encryptionconfig secret; control plane with encryption only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_config_secret_hash: Option<String>,
    /// Cluster DNS domain, e.g. `cluster.local`
    pub dns_domain: String,
    /// Service network ranges
    pub service_cidrs: Vec<String>,
    /// Pod network ranges
    pub pod_cidrs: Vec<String>,
}

impl BootConfig {
    /// YAML encoding embedded in the boot script.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Serialization`] on encoder failure.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Assembles [`BootConfig`] values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigBuilder;

impl ConfigBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Builds the boot configuration. Any missing prerequisite aborts the
    /// whole build.
    ///
    /// # Errors
    ///
    /// `InvalidCluster`, `RoleNotSet`, `MissingEndpoint`, `MissingKeyset`,
    /// `NoPrimary` or `MissingEncryptionSecret`.
    pub fn build(
        &self,
        cluster: &Cluster,
        instance_group: &InstanceGroup,
        well_known: &WellKnownAddresses,
        keysets: &Keysets,
        encryption_secret: Option<&[u8]>,
    ) -> Result<BootConfig, ConfigError> {
        cluster.validate()?;
        let role = instance_group
            .spec
            .role
            .ok_or_else(|| ConfigError::RoleNotSet(instance_group.name().to_string()))?;

        let cloud_provider = cluster.spec.cloud_provider;

        if role.needs_well_known_addresses() {
            for service in [WellKnownService::KopsController, WellKnownService::KubeApiServerInternal] {
                if well_known.get(service).is_empty() {
                    return Err(ConfigError::MissingEndpoint(service.as_str().to_string()));
                }
            }
        }
        let well_known_addresses = well_known.clone();

        let ca = keysets
            .get(KUBERNETES_CA)
            .ok_or_else(|| ConfigError::MissingKeyset(KUBERNETES_CA.to_string()))?;
        let ca_certificates = ca.primary_certificate()?.to_string();

        let encryption_config_secret_hash =
            if cluster.encryption_enabled() && matches!(role, Role::ControlPlane | Role::ApiServerOnly) {
                let secret = encryption_secret.ok_or(ConfigError::MissingEncryptionSecret)?;
                Some(encryption_digest(secret))
            } else {
                None
            };

        let config_server = match role {
            Role::Node | Role::ApiServerOnly => well_known
                .get(WellKnownService::KopsController)
                .first()
                .map(|ep| ConfigServer {
                    server: format!("https://{}:{}/", ep.url_host(), CONFIG_SERVER_PORT),
                    ca_certificates: ca_certificates.clone(),
                }),
            Role::ControlPlane | Role::Bastion => None,
        };

        debug!(
            "Built boot configuration for {}/{} (role {})",
            cluster.name(),
            instance_group.name(),
            role
        );
        Ok(BootConfig {
            cloud_provider,
            kubernetes_version: cluster.spec.kubernetes_version.clone(),
            cluster_name: cluster.name().to_string(),
            instance_group_name: instance_group.name().to_string(),
            instance_group_role: role,
            well_known_addresses,
            ca_certificates,
            config_server,
            encryption_config_secret_hash,
            dns_domain: cluster.spec.networking.dns_domain.clone(),
            service_cidrs: cluster.spec.networking.service_cidrs.clone(),
            pod_cidrs: cluster.spec.networking.pod_cidrs.clone(),
        })
    }
}

/// `base64url(sha256(secret))`.
#[must_use]
pub fn encryption_digest(secret: &[u8]) -> String {
    URL_SAFE.encode(Sha256::digest(secret))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::cluster::tests::test_cluster;
    use crate::model::instance_group::tests::test_instance_group;
    use crate::model::keyset::tests::TEST_CA_PEM;

    pub(crate) fn test_well_known() -> WellKnownAddresses {
        WellKnownAddresses::default()
            .with(WellKnownService::KubeApiServerInternal, "10.0.16.2")
            .with(WellKnownService::KopsController, "10.0.16.2")
    }

    pub(crate) fn test_keysets() -> Keysets {
        let mut keysets = Keysets::new();
        keysets.insert(KUBERNETES_CA.to_string(), Keyset::single(KUBERNETES_CA, "1", TEST_CA_PEM));
        keysets
    }

    #[test]
    fn test_build_node_config() {
        let cfg = ConfigBuilder::new()
            .build(&test_cluster(), &test_instance_group(Role::Node), &test_well_known(), &test_keysets(), None)
            .expect("build");
        assert_eq!(cfg.kubernetes_version, "1.28.3");
        assert_eq!(cfg.cloud_provider, CloudProvider::Aws);
        assert_eq!(cfg.ca_certificates, TEST_CA_PEM);
        assert_eq!(
            cfg.config_server.as_ref().map(|c| c.server.as_str()),
            Some("https://10.0.16.2:3988/")
        );
        assert!(cfg.encryption_config_secret_hash.is_none());
    }

    #[test]
    fn test_build_is_deterministic() {
        let build = || {
            ConfigBuilder::new()
                .build(&test_cluster(), &test_instance_group(Role::Node), &test_well_known(), &test_keysets(), None)
                .expect("build")
                .to_yaml()
                .expect("yaml")
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_missing_keyset() {
        let err = ConfigBuilder::new()
            .build(&test_cluster(), &test_instance_group(Role::Node), &test_well_known(), &Keysets::new(), None)
            .expect_err("missing keyset");
        assert!(matches!(err, ConfigError::MissingKeyset(name) if name == "kubernetes-ca"));
    }

    #[test]
    fn test_missing_endpoint_only_for_discovering_roles() {
        let wka = WellKnownAddresses::default().with(WellKnownService::KopsController, "10.0.16.2");
        let err = ConfigBuilder::new()
            .build(&test_cluster(), &test_instance_group(Role::Node), &wka, &test_keysets(), None)
            .expect_err("missing apiserver");
        assert!(matches!(err, ConfigError::MissingEndpoint(s) if s == "kube-apiserver-internal"));

        let cfg = ConfigBuilder::new()
            .build(
                &test_cluster(),
                &test_instance_group(Role::ControlPlane),
                &WellKnownAddresses::default(),
                &test_keysets(),
                None,
            )
            .expect("control plane needs no addresses");
        assert!(cfg.config_server.is_none());
    }

    #[test]
    fn test_role_not_set() {
        let mut ig = test_instance_group(Role::Node);
        ig.spec.role = None;
        let err = ConfigBuilder::new()
            .build(&test_cluster(), &ig, &test_well_known(), &test_keysets(), None)
            .expect_err("no role");
        assert!(matches!(err, ConfigError::RoleNotSet(_)));
    }

    #[test]
    fn test_encryption_digest_for_control_plane() {
        let mut cluster = test_cluster();
        cluster.spec.encryption_config = Some(true);
        let ig = test_instance_group(Role::ControlPlane);

        let err = ConfigBuilder::new()
            .build(&cluster, &ig, &test_well_known(), &test_keysets(), None)
            .expect_err("secret required");
        assert!(matches!(err, ConfigError::MissingEncryptionSecret));

        let cfg = ConfigBuilder::new()
            .build(&cluster, &ig, &test_well_known(), &test_keysets(), Some(b"secret"))
            .expect("build");
        // sha256("secret"), URL-safe base64 with padding
        assert_eq!(
            cfg.encryption_config_secret_hash.as_deref(),
            Some("K7gNU3sdo-OL0wNhqoVWhr3g6s1xYv72ol_pe_Unols=")
        );
    }

    #[test]
    fn test_yaml_roundtrips_well_known_tags() {
        let cfg = ConfigBuilder::new()
            .build(&test_cluster(), &test_instance_group(Role::Node), &test_well_known(), &test_keysets(), None)
            .expect("build");
        let yaml = cfg.to_yaml().expect("yaml");
        assert!(yaml.contains("kops-controller:"));
        assert!(yaml.contains("kube-apiserver-internal:"));
        let back: BootConfig = serde_yaml::from_str(&yaml).expect("parse");
        assert_eq!(back, cfg);
    }
}
