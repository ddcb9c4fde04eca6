//! Decentralized IP address allocation
//!
//! A fleet of peers shares one address universe without a central server.
//! The universe is carved into a [`ring`] of owner-tagged, versioned ranges,
//! agreed first through [`paxos`] (or a supplied seed) and kept in sync by
//! gossip. Each peer allocates from the ranges it owns and asks other peers
//! to donate space when it runs out.
//!
//! - [`allocator::Allocator`]: the event-driven core
//! - [`actor::AllocatorHandle`]: runs the core on a task behind a channel
//! - [`gossip::GossipTransport`]: how peers reach each other
//! - [`db::Db`]: where the ring and ownership records are persisted
//!
//! # Example
//!
//! ```no_run
//! use ipam::{AllocatorConfig, AllocatorHandle, Allocator, FileDb, PeerName, SystemClock};
//! # use ipam::gossip::{GossipError, GossipTransport};
//! # use std::sync::Arc;
//! # struct Quiet;
//! # impl GossipTransport for Quiet {
//! #     fn gossip_unicast(&self, _: &PeerName, _: Vec<u8>) -> Result<(), GossipError> { Ok(()) }
//! #     fn gossip_broadcast(&self, _: Vec<u8>) {}
//! #     fn is_known_peer(&self, _: &PeerName) -> bool { false }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let name = PeerName::from("peer-a");
//! let mut config = AllocatorConfig::new(name.clone(), "10.32.0.0/12".parse()?);
//! config.seed = vec![name];
//!
//! let mut alloc = Allocator::new(
//!     config,
//!     Arc::new(Quiet),
//!     Arc::new(FileDb::open("/var/lib/ipam")?),
//!     Arc::new(SystemClock),
//! );
//! alloc.start()?;
//! let (handle, _task) = AllocatorHandle::spawn(alloc);
//! let addr = handle.allocate("container-1", "10.32.0.0/12".parse()?, true).await?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod address;
pub mod allocator;
pub mod clock;
pub mod db;
pub mod error;
pub mod gossip;
pub mod paxos;
pub mod peer;
pub mod ring;
pub mod space;

pub use actor::AllocatorHandle;
pub use address::{Address, Cidr, Count, Family, Range};
pub use allocator::{Allocator, AllocatorConfig, AllocatorStatus, PreClaim};
pub use clock::{Clock, SystemClock};
pub use db::{Db, FileDb};
pub use error::AllocatorError;
pub use peer::PeerName;
pub use ring::RingError;
