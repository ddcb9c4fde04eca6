//! Kops Cluster API CRD Definitions
//!
//! Custom resources shared by the bootstrap controller and `crdgen`.

pub mod kops_config;
pub mod kops_control_plane;

pub use kops_config::*;
pub use kops_control_plane::*;
