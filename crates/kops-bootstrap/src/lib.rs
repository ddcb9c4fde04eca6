//! Node Bootstrap Pipeline
//!
//! Turns a declarative cluster specification into the user-data payload a
//! freshly provisioned machine executes on first boot.
//!
//! The pipeline has three stages, each usable on its own:
//!
//! - [`assets`]: resolves the architecture-specific `nodeup` binary into a
//!   [`MirroredAsset`] (ordered mirrors plus a SHA-256 hash)
//! - [`config`]: assembles the immutable [`BootConfig`] from the cluster,
//!   instance group, well-known addresses and keysets
//! - [`render`]: renders the self-contained first-boot shell script
//!
//! [`pipeline::BootstrapPipeline`] drives all three against a state store
//! reached through the [`vfs`] layer.
//!
//! # Example
//!
//! ```no_run
//! use kops_bootstrap::pipeline::{BootstrapPipeline, BootstrapRequest, InstanceGroupSource};
//! use kops_bootstrap::vfs::VfsContext;
//! use kops_bootstrap::model::WellKnownAddresses;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let vfs = VfsContext::with_default_stores()?;
//! let pipeline = BootstrapPipeline::new(vfs, "file:///srv/kops-state")?;
//!
//! let request = BootstrapRequest {
//!     cluster_name: "dev.example.com".to_string(),
//!     instance_group: InstanceGroupSource::Named("nodes".to_string()),
//!     well_known_addresses: WellKnownAddresses::default(),
//! };
//! let script = pipeline.build(&request).await?;
//! println!("{} bytes of user-data", script.len());
//! # Ok(())
//! # }
//! ```

pub mod assets;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod render;
pub mod vfs;

pub use assets::{Architecture, AssetResolver, MirroredAsset};
pub use config::{BootConfig, ConfigBuilder};
pub use error::{BootstrapError, ErrorKind};
pub use render::{RenderOptions, ScriptRenderer};
