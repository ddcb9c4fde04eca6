//! Error taxonomy for the bootstrap pipeline.

use crate::assets::AssetError;
use crate::config::ConfigError;
use crate::render::RenderError;
use crate::vfs::VfsError;
use thiserror::Error;

/// Conceptual classification used by callers to decide retry vs fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Cluster or instance group data is missing a required field or is malformed.
    /// Not retryable until the resource is edited.
    Configuration,

    /// A prerequisite (keyset, well-known address, encryption secret) is absent.
    PrerequisiteMissing,

    /// A hash does not match or is malformed.
    Integrity,

    /// Network or IO failure reading the state store.
    Transport,
}

impl ErrorKind {
    /// Returns true when retrying the same input may succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::PrerequisiteMissing | ErrorKind::Transport)
    }
}

/// Top-level error returned by [`crate::pipeline::BootstrapPipeline`].
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("asset resolution failed: {0}")]
    Asset(#[from] AssetError),

    #[error("boot configuration failed: {0}")]
    Config(#[from] ConfigError),

    #[error("script rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("state store error: {0}")]
    Vfs(#[from] VfsError),
}

impl BootstrapError {
    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            BootstrapError::Asset(e) => match e {
                AssetError::NotConfigured(_) => ErrorKind::Configuration,
                AssetError::HashMissing(_) => ErrorKind::PrerequisiteMissing,
                AssetError::InvalidHash { .. } => ErrorKind::Integrity,
                AssetError::Source(vfs) => vfs_kind(vfs),
            },
            BootstrapError::Config(e) => match e {
                ConfigError::MissingKeyset(_)
                | ConfigError::NoPrimary(_)
                | ConfigError::MissingEndpoint(_)
                | ConfigError::MissingEncryptionSecret => ErrorKind::PrerequisiteMissing,
                ConfigError::RoleNotSet(_)
                | ConfigError::InvalidCluster(_)
                | ConfigError::Serialization(_) => ErrorKind::Configuration,
            },
            BootstrapError::Render(_) => ErrorKind::Configuration,
            BootstrapError::Vfs(e) => vfs_kind(e),
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

fn vfs_kind(err: &VfsError) -> ErrorKind {
    match err {
        VfsError::NotFound(_) => ErrorKind::PrerequisiteMissing,
        VfsError::Io { .. } | VfsError::Http { .. } => ErrorKind::Transport,
        VfsError::UnsupportedScheme(_) | VfsError::InvalidPath(_) | VfsError::Parse { .. } => {
            ErrorKind::Configuration
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keyset_is_prerequisite() {
        let err = BootstrapError::from(ConfigError::MissingKeyset("kubernetes-ca".to_string()));
        assert_eq!(err.kind(), ErrorKind::PrerequisiteMissing);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_configuration_is_not_retryable() {
        let err = BootstrapError::from(ConfigError::InvalidCluster("bad".to_string()));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_is_retryable() {
        let err = BootstrapError::from(VfsError::Http {
            url: "https://state.example.com/x".to_string(),
            message: "connection reset".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_hash_is_integrity() {
        let err = BootstrapError::from(AssetError::InvalidHash {
            asset: "amd64/nodeup".to_string(),
            value: "zz".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }
}
