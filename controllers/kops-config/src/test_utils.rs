//! Test utilities for unit testing the reconciler
//!
//! In-memory cluster objects and a pipeline over a memfs state store.

use crate::cluster_objects::ClusterObjects;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use async_trait::async_trait;
use crds::*;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kops_bootstrap::AssetResolver;
use kops_bootstrap::assets::{AssetDefaults, StaticHashes};
use kops_bootstrap::pipeline::BootstrapPipeline;
use kops_bootstrap::vfs::{MemoryStore, VfsContext};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub const CLUSTER_YAML: &str = r"
metadata:
  name: dev.example.com
spec:
  kubernetesVersion: 1.28.3
  cloudProvider: aws
  networking:
    podCidrs: [10.0.0.0/16]
    serviceCidrs: [10.96.0.0/12]
    dnsDomain: cluster.local
";

pub const NODES_YAML: &str = r"
metadata:
  name: nodes
spec:
  role: Node
  machineType: t3.medium
  image: ubuntu-22.04
  zones: [us-east-1a]
  minSize: 1
  maxSize: 3
";

pub const KEYSET_YAML: &str = r"
metadata:
  name: kubernetes-ca
spec:
  primaryID: '7001'
  keys:
  - id: '7001'
    publicMaterial: |
      -----BEGIN CERTIFICATE-----
      MIIBdTCCARugAwIBAgIUPRIMARY
      -----END CERTIFICATE-----
";

pub const KEYSET_PATH: &str = "memfs://state/dev.example.com/pki/issued/kubernetes-ca/keyset.yaml";

/// State store holding the dev.example.com cluster, its "nodes" group and CA.
pub fn state_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.insert("memfs://state/dev.example.com/config", CLUSTER_YAML);
    store.insert("memfs://state/dev.example.com/instancegroup/nodes", NODES_YAML);
    store.insert(KEYSET_PATH, KEYSET_YAML);
    store
}

/// Pipeline over `store` with pinned nodeup hashes.
pub fn test_pipeline(store: &MemoryStore) -> BootstrapPipeline {
    let mut vfs = VfsContext::new();
    vfs.register("memfs", Arc::new(store.clone()));

    let hashes = BTreeMap::from([
        ("amd64/nodeup".to_string(), "a".repeat(64)),
        ("arm64/nodeup".to_string(), "b".repeat(64)),
    ]);
    let resolver = AssetResolver::new(AssetDefaults::default(), Box::new(StaticHashes(hashes)));

    BootstrapPipeline::new(vfs, "memfs://state")
        .expect("pipeline")
        .with_asset_resolver(resolver)
}

/// Reconciler wired to `store` and `objects`.
pub fn test_reconciler(store: &MemoryStore, objects: &MockClusterObjects) -> Reconciler {
    Reconciler::new(test_pipeline(store), Box::new(objects.clone()))
}

/// KopsConfig labeled with `cluster`, requesting the named group.
pub fn create_test_kops_config(name: &str, namespace: &str, cluster: Option<&str>, instance_group: &str) -> KopsConfig {
    KopsConfig {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            labels: cluster.map(|c| BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), c.to_string())])),
            ..Default::default()
        },
        spec: KopsConfigSpec {
            instance_group_name: Some(instance_group.to_string()),
            ..Default::default()
        },
        status: None,
    }
}

/// KopsControlPlane publishing kops-controller and kube-apiserver at `ip`.
pub fn create_test_control_plane(name: &str, namespace: &str, cluster_name: Option<&str>, ip: &str) -> KopsControlPlane {
    KopsControlPlane {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: KopsControlPlaneSpec {
            cluster_name: cluster_name.map(str::to_string),
        },
        status: Some(KopsControlPlaneStatus {
            system_endpoints: vec![
                SystemEndpoint {
                    endpoint_type: SystemEndpointType::KopsController,
                    endpoint: ip.to_string(),
                    scope: SystemEndpointScope::Internal,
                },
                SystemEndpoint {
                    endpoint_type: SystemEndpointType::KubeApiServer,
                    endpoint: ip.to_string(),
                    scope: SystemEndpointScope::Internal,
                },
            ],
        }),
    }
}

#[derive(Default)]
struct MockState {
    control_planes: HashMap<String, KopsControlPlane>,
    secrets: HashMap<String, Secret>,
    statuses: HashMap<String, KopsConfigStatus>,
    deleted_configs: HashSet<String>,
    creates: usize,
    replaces: usize,
    next_version: u64,
}

/// In-memory [`ClusterObjects`]; clones share state.
#[derive(Clone, Default)]
pub struct MockClusterObjects {
    state: Arc<Mutex<MockState>>,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl MockClusterObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_control_plane(&self, control_plane: KopsControlPlane) {
        let namespace = control_plane.metadata.namespace.clone().unwrap_or_default();
        let name = control_plane.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .control_planes
            .insert(key(&namespace, &name), control_plane);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state.lock().unwrap().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn status(&self, namespace: &str, name: &str) -> Option<KopsConfigStatus> {
        self.state.lock().unwrap().statuses.get(&key(namespace, name)).cloned()
    }

    pub fn creates(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    pub fn replaces(&self) -> usize {
        self.state.lock().unwrap().replaces
    }

    /// Makes later status patches for the KopsConfig report it as gone.
    pub fn delete_config(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.statuses.remove(&key(namespace, name));
        state.deleted_configs.insert(key(namespace, name));
    }

    /// Overwrites the stored user data without counting as a replace.
    pub fn tamper_secret(&self, namespace: &str, name: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if let Some(secret) = state.secrets.get_mut(&key(namespace, name)) {
            secret.data = Some(BTreeMap::from([(
                BOOTSTRAP_DATA_KEY.to_string(),
                k8s_openapi::ByteString(data.to_vec()),
            )]));
        }
    }
}

#[async_trait]
impl ClusterObjects for MockClusterObjects {
    async fn get_control_plane(&self, namespace: &str, name: &str) -> Result<Option<KopsControlPlane>, ControllerError> {
        Ok(self.state.lock().unwrap().control_planes.get(&key(namespace, name)).cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ControllerError> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.next_version += 1;
        let mut stored = secret.clone();
        stored.metadata.resource_version = Some(state.next_version.to_string());
        let name = stored.metadata.name.clone().unwrap_or_default();
        state.secrets.insert(key(namespace, &name), stored);
        state.creates += 1;
        Ok(())
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        let name = secret.metadata.name.clone().unwrap_or_default();
        let current = state
            .secrets
            .get(&key(namespace, &name))
            .and_then(|s| s.metadata.resource_version.clone());
        assert_eq!(current, secret.metadata.resource_version, "replace must carry the resourceVersion");
        state.next_version += 1;
        let mut stored = secret.clone();
        stored.metadata.resource_version = Some(state.next_version.to_string());
        state.secrets.insert(key(namespace, &name), stored);
        state.replaces += 1;
        Ok(())
    }

    async fn patch_config_status(
        &self,
        namespace: &str,
        name: &str,
        status: &KopsConfigStatus,
    ) -> Result<bool, ControllerError> {
        let mut state = self.state.lock().unwrap();
        if state.deleted_configs.contains(&key(namespace, name)) {
            return Ok(false);
        }
        state.statuses.insert(key(namespace, name), status.clone());
        Ok(true)
    }
}
