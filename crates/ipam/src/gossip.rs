//! Gossip payloads and the transport the allocator talks through.
//!
//! Payloads are JSON documents carrying `"version": 1`. Broadcasts carry a
//! [`GossipData`]; unicasts carry a [`UnicastMessage`] tagged by kind.

use crate::address::Range;
use crate::error::AllocatorError;
use crate::paxos::GossipState;
use crate::peer::PeerName;
use crate::ring::Ring;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 1;

/// Transport failures when sending to a peer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GossipError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerName),

    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: PeerName, reason: String },
}

/// How the allocator reaches other peers.
///
/// Sends must not block: implementations queue and deliver out of band.
pub trait GossipTransport: Send + Sync {
    /// Sends to one peer.
    ///
    /// # Errors
    ///
    /// The peer is unknown or cannot currently be reached.
    fn gossip_unicast(&self, dest: &PeerName, msg: Vec<u8>) -> Result<(), GossipError>;

    /// Sends to every peer.
    fn gossip_broadcast(&self, msg: Vec<u8>);

    /// Whether `peer` is currently connected.
    fn is_known_peer(&self, peer: &PeerName) -> bool;
}

/// State every peer broadcasts: the ring once there is one, Paxos state
/// before that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipData {
    pub version: u32,
    /// Sender's clock, in Unix seconds.
    pub now: i64,
    #[serde(default)]
    pub nicknames: BTreeMap<PeerName, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paxos: Option<GossipState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring: Option<Ring>,
}

impl GossipData {
    /// # Errors
    ///
    /// Serialization failures.
    pub fn encode(&self) -> Result<Vec<u8>, AllocatorError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// # Errors
    ///
    /// `Decode` for malformed input or an unknown protocol version.
    pub fn decode(bytes: &[u8]) -> Result<Self, AllocatorError> {
        let data: GossipData = serde_json::from_slice(bytes)?;
        check_version(data.version)?;
        Ok(data)
    }
}

/// Point-to-point messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnicastMessage {
    /// Asks the recipient to donate space inside the range.
    SpaceRequest(Range),
    RingUpdate(GossipData),
    /// The recipient of a space request had nothing free in the range.
    SpaceRequestDenied(Range),
}

#[derive(Serialize, Deserialize)]
struct UnicastEnvelope {
    version: u32,
    message: UnicastMessage,
}

impl UnicastMessage {
    /// # Errors
    ///
    /// Serialization failures.
    pub fn encode(self) -> Result<Vec<u8>, AllocatorError> {
        let envelope = UnicastEnvelope {
            version: PROTOCOL_VERSION,
            message: self,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// # Errors
    ///
    /// `Decode` for malformed input or an unknown protocol version.
    pub fn decode(bytes: &[u8]) -> Result<Self, AllocatorError> {
        let envelope: UnicastEnvelope = serde_json::from_slice(bytes)?;
        check_version(envelope.version)?;
        Ok(envelope.message)
    }
}

fn check_version(version: u32) -> Result<(), AllocatorError> {
    if version == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(AllocatorError::Decode(format!(
            "unsupported gossip version {version}"
        )))
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryRouter, MemoryTransport};

#[cfg(any(test, feature = "test-util"))]
mod memory {
    use super::{GossipError, GossipTransport};
    use crate::allocator::Allocator;
    use crate::peer::PeerName;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard};

    /// Upper bound on deliveries per flush, in case peers never go quiet.
    const MAX_DELIVERIES: usize = 100_000;

    #[derive(Debug, Clone)]
    struct Message {
        from: PeerName,
        to: Option<PeerName>,
        payload: Vec<u8>,
    }

    #[derive(Debug, Default)]
    struct RouterState {
        queue: VecDeque<Message>,
        alive: BTreeMap<PeerName, bool>,
    }

    /// In-process message bus connecting allocators in tests. Messages queue
    /// up until [`MemoryRouter::flush`] delivers them.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryRouter {
        state: Arc<Mutex<RouterState>>,
    }

    impl MemoryRouter {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, RouterState> {
            self.state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }

        /// Registers a live peer and returns its transport.
        #[must_use]
        pub fn connect(&self, peer: &PeerName) -> MemoryTransport {
            self.lock().alive.insert(peer.clone(), true);
            MemoryTransport {
                peer: peer.clone(),
                router: self.clone(),
            }
        }

        /// Marks a peer up or down. Messages to a down peer are dropped.
        pub fn set_alive(&self, peer: &PeerName, alive: bool) {
            self.lock().alive.insert(peer.clone(), alive);
        }

        #[must_use]
        pub fn pending(&self) -> usize {
            self.lock().queue.len()
        }

        fn is_alive(&self, peer: &PeerName) -> bool {
            self.lock().alive.get(peer).copied().unwrap_or(false)
        }

        fn pop(&self) -> Option<Message> {
            self.lock().queue.pop_front()
        }

        /// Delivers queued messages, including those sent in response, until
        /// the queue is empty. Returns the number delivered.
        pub fn flush(&self, peers: &mut BTreeMap<PeerName, Allocator>) -> usize {
            let mut delivered = 0;
            while delivered < MAX_DELIVERIES {
                let Some(msg) = self.pop() else {
                    break;
                };
                delivered += 1;
                if !self.is_alive(&msg.from) {
                    continue;
                }
                match &msg.to {
                    Some(dest) => {
                        if self.is_alive(dest) {
                            if let Some(alloc) = peers.get_mut(dest) {
                                let _ = alloc.on_gossip_unicast(&msg.from, &msg.payload);
                            }
                        }
                    }
                    None => {
                        for (name, alloc) in peers.iter_mut() {
                            if name != &msg.from && self.is_alive(name) {
                                let _ = alloc.on_gossip_broadcast(&msg.from, &msg.payload);
                            }
                        }
                    }
                }
            }
            delivered
        }
    }

    /// One peer's handle on a [`MemoryRouter`].
    #[derive(Debug, Clone)]
    pub struct MemoryTransport {
        peer: PeerName,
        router: MemoryRouter,
    }

    impl GossipTransport for MemoryTransport {
        fn gossip_unicast(&self, dest: &PeerName, msg: Vec<u8>) -> Result<(), GossipError> {
            let mut state = self.router.lock();
            match state.alive.get(dest) {
                None => Err(GossipError::UnknownPeer(dest.clone())),
                Some(false) => Err(GossipError::Unreachable {
                    peer: dest.clone(),
                    reason: "peer is down".to_string(),
                }),
                Some(true) => {
                    state.queue.push_back(Message {
                        from: self.peer.clone(),
                        to: Some(dest.clone()),
                        payload: msg,
                    });
                    Ok(())
                }
            }
        }

        fn gossip_broadcast(&self, msg: Vec<u8>) {
            self.router.lock().queue.push_back(Message {
                from: self.peer.clone(),
                to: None,
                payload: msg,
            });
        }

        fn is_known_peer(&self, peer: &PeerName) -> bool {
            peer != &self.peer && self.router.is_alive(peer)
        }
    }
}
