//! Cluster data model consumed read-only by the pipeline.
//!
//! These types mirror the objects kept in the state store: the cluster
//! specification, instance groups and CA keysets, plus the well-known
//! address map supplied by the control plane.

pub mod cluster;
pub mod instance_group;
pub mod keyset;
pub mod secret;
pub mod well_known;

pub use cluster::{
    AssetsSpec, CloudProvider, Cluster, ClusterSpec, EgressProxySpec, NetworkingSpec, ObjectName,
    SubnetSpec,
};
pub use instance_group::{InstanceGroup, InstanceGroupSpec, Role, UserData};
pub use keyset::{KUBERNETES_CA, Keyset, KeysetItem, KeysetSpec};
pub use secret::{ENCRYPTION_CONFIG_SECRET, StoredSecret};
pub use well_known::{Endpoint, WellKnownAddresses, WellKnownService};
