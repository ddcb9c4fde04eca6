//! CA keysets as stored under `pki/issued/<ca-name>/keyset.yaml`.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};

/// Name of the keyset that pins the control plane.
pub const KUBERNETES_CA: &str = "kubernetes-ca";

/// A named collection of keypairs with exactly one primary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Keyset {
    /// Object metadata; the name is the CA name
    pub metadata: super::ObjectName,

    /// Keys
    pub spec: KeysetSpec,
}

/// Keyset body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KeysetSpec {
    /// ID of the primary key
    #[serde(default, rename = "primaryID", alias = "primaryId")]
    pub primary_id: String,

    /// Keypairs
    #[serde(default)]
    pub keys: Vec<KeysetItem>,
}

/// One keypair; only public material is consumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeysetItem {
    /// Key ID
    pub id: String,

    /// PEM-encoded certificate
    #[serde(default)]
    pub public_material: String,
}

impl Keyset {
    /// Builds a keyset with a single primary certificate.
    #[must_use]
    pub fn single(name: &str, id: &str, certificate_pem: &str) -> Self {
        Self {
            metadata: super::ObjectName { name: name.to_string() },
            spec: KeysetSpec {
                primary_id: id.to_string(),
                keys: vec![KeysetItem {
                    id: id.to_string(),
                    public_material: certificate_pem.to_string(),
                }],
            },
        }
    }

    /// Keyset name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Returns the primary certificate PEM.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoPrimary`] when no key matches the primary ID or its
    /// certificate is empty.
    pub fn primary_certificate(&self) -> Result<&str, ConfigError> {
        self.spec
            .keys
            .iter()
            .find(|k| !self.spec.primary_id.is_empty() && k.id == self.spec.primary_id)
            .map(|k| k.public_material.as_str())
            .filter(|pem| !pem.trim().is_empty())
            .ok_or_else(|| ConfigError::NoPrimary(self.name().to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBdTCCARugAwIBAgIUTEST\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_primary_certificate() {
        let ks = Keyset::single(KUBERNETES_CA, "7001", TEST_CA_PEM);
        assert_eq!(ks.primary_certificate().expect("primary"), TEST_CA_PEM);
    }

    #[test]
    fn test_no_primary() {
        let mut ks = Keyset::single(KUBERNETES_CA, "7001", TEST_CA_PEM);
        ks.spec.primary_id = "9999".to_string();
        assert!(matches!(ks.primary_certificate(), Err(ConfigError::NoPrimary(n)) if n == KUBERNETES_CA));

        let ks = Keyset::single(KUBERNETES_CA, "7001", "  ");
        assert!(ks.primary_certificate().is_err());
    }

    #[test]
    fn test_keyset_yaml() {
        let yaml = r"
metadata:
  name: kubernetes-ca
spec:
  primaryID: '1'
  keys:
  - id: '1'
    publicMaterial: |
      -----BEGIN CERTIFICATE-----
      abc
      -----END CERTIFICATE-----
";
        let ks: Keyset = serde_yaml::from_str(yaml).expect("keyset");
        assert!(ks.primary_certificate().expect("primary").contains("abc"));
    }
}
