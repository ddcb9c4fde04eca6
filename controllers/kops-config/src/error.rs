//! Controller-specific error types.

use kops_bootstrap::BootstrapError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the KopsConfig Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Bootstrap data could not be built
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// Invalid configuration (environment or resource spec)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The KopsConfig carries no cluster-name label
    #[error("cluster name label {label:?} not yet set on {object}")]
    MissingClusterLabel { object: String, label: String },

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether reconciling the same generation again may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Kube(_) | ControllerError::Watch(_) => true,
            ControllerError::Bootstrap(e) => e.is_retryable(),
            ControllerError::InvalidConfig(_) | ControllerError::MissingClusterLabel { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kops_bootstrap::config::ConfigError;

    #[test]
    fn test_retry_classification() {
        let missing_keyset = ControllerError::from(BootstrapError::from(ConfigError::MissingKeyset(
            "kubernetes-ca".to_string(),
        )));
        assert!(missing_keyset.is_retryable());

        let bad_cluster = ControllerError::from(BootstrapError::from(ConfigError::InvalidCluster(
            "no kubernetesVersion".to_string(),
        )));
        assert!(!bad_cluster.is_retryable());

        let no_label = ControllerError::MissingClusterLabel {
            object: "default/node-0".to_string(),
            label: crds::CLUSTER_NAME_LABEL.to_string(),
        };
        assert!(!no_label.is_retryable());
        assert!(no_label.to_string().contains("cluster.x-k8s.io/cluster-name"));
    }
}
