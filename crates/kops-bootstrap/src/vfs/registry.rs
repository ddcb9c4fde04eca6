use super::{VfsContext, VfsError, VfsPath};
use crate::model::{Cluster, InstanceGroup, Keyset, StoredSecret};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Typed reads from the cluster registry layout:
///
/// ```text
/// <base>/<cluster>/config
/// <base>/<cluster>/instancegroup/<ig>
/// <base>/<cluster>/pki/issued/<ca>/keyset.yaml
/// <base>/<cluster>/secrets/<name>
/// ```
#[derive(Debug, Clone)]
pub struct StateStoreRegistry {
    vfs: VfsContext,
    base: VfsPath,
}

impl StateStoreRegistry {
    /// Creates a registry rooted at `base`.
    ///
    /// # Errors
    ///
    /// [`VfsError::InvalidPath`] when `base` has no scheme;
    /// [`VfsError::UnsupportedScheme`] when no backend serves it.
    pub fn new(vfs: VfsContext, base: &str) -> Result<Self, VfsError> {
        let base = VfsPath::parse(base)?;
        if !vfs.supports(base.scheme()) {
            return Err(VfsError::UnsupportedScheme(base.scheme().to_string()));
        }
        Ok(Self { vfs, base })
    }

    /// Registry root.
    #[must_use]
    pub fn base(&self) -> &VfsPath {
        &self.base
    }

    /// Underlying VFS context.
    #[must_use]
    pub fn vfs(&self) -> &VfsContext {
        &self.vfs
    }

    /// Loads the cluster specification.
    ///
    /// # Errors
    ///
    /// `NotFound` when the cluster is unknown; `Parse` for malformed YAML.
    pub async fn read_cluster(&self, cluster_name: &str) -> Result<Cluster, VfsError> {
        let path = self.base.join(cluster_name).join("config");
        self.read_yaml(&path).await
    }

    /// Loads an instance group.
    ///
    /// # Errors
    ///
    /// `NotFound` when the group is unknown; `Parse` for malformed YAML.
    pub async fn read_instance_group(
        &self,
        cluster_name: &str,
        group_name: &str,
    ) -> Result<InstanceGroup, VfsError> {
        let path = self
            .base
            .join(cluster_name)
            .join("instancegroup")
            .join(group_name);
        self.read_yaml(&path).await
    }

    /// Loads a CA keyset; `Ok(None)` when it has not been issued.
    ///
    /// # Errors
    ///
    /// Transport and parse failures.
    pub async fn read_keyset(
        &self,
        cluster_name: &str,
        ca_name: &str,
    ) -> Result<Option<Keyset>, VfsError> {
        let path = self
            .base
            .join(cluster_name)
            .join("pki/issued")
            .join(ca_name)
            .join("keyset.yaml");
        match self.read_yaml(&path).await {
            Ok(keyset) => Ok(Some(keyset)),
            Err(VfsError::NotFound(_)) => {
                debug!("Keyset {} not found at {}", ca_name, path);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Loads a secret's decoded bytes; `Ok(None)` when absent.
    ///
    /// # Errors
    ///
    /// Transport failures, malformed JSON or invalid base64.
    pub async fn read_secret(
        &self,
        cluster_name: &str,
        secret_name: &str,
    ) -> Result<Option<Vec<u8>>, VfsError> {
        let path = self.base.join(cluster_name).join("secrets").join(secret_name);
        let raw = match self.vfs.read_file(&path).await {
            Ok(raw) => raw,
            Err(VfsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let parse_err = |message: String| VfsError::Parse {
            path: path.to_string(),
            message,
        };
        let secret: StoredSecret =
            serde_json::from_slice(&raw).map_err(|e| parse_err(e.to_string()))?;
        secret
            .bytes()
            .map(Some)
            .map_err(|e| parse_err(e.to_string()))
    }

    async fn read_yaml<T: DeserializeOwned>(&self, path: &VfsPath) -> Result<T, VfsError> {
        let raw = self.vfs.read_file(path).await?;
        serde_yaml::from_slice(&raw).map_err(|e| VfsError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })
    }
}
