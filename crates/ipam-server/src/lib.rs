//! Hosted IPAM allocator
//!
//! Runs an [`ipam::Allocator`] behind an HTTP API, gossips with the other
//! peers over HTTP and exposes Prometheus metrics.
//!
//! - [`config`]: `IPAM_*` environment configuration
//! - [`api`]: the axum router
//! - [`transport`]: HTTP gossip transport and the periodic broadcast
//! - [`metrics`]: Prometheus registry

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod transport;

pub use api::{AppState, router};
pub use config::ServerConfig;
pub use error::ServerError;
pub use metrics::Metrics;
pub use transport::{HttpGossip, spawn_periodic_gossip};
