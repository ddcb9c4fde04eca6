//! Gossip between peers over HTTP.
//!
//! Sends never block the allocator: messages go onto a bounded queue and a
//! delivery task POSTs them to the peers' `/gossip/*` endpoints. A peer whose
//! last delivery failed counts as unreachable until a later one succeeds.

use crate::error::ServerError;
use ipam::gossip::{GossipError, GossipTransport};
use ipam::{AllocatorError, AllocatorHandle, PeerName};
use reqwest::Client;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Header naming the sending peer on gossip requests.
pub const PEER_HEADER: &str = "X-Ipam-Peer";

const OUTBOX_CAPACITY: usize = 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Outbound {
    Unicast { dest: PeerName, payload: Vec<u8> },
    Broadcast(Vec<u8>),
}

/// HTTP gossip transport for a fixed set of peers.
#[derive(Debug)]
pub struct HttpGossip {
    our_name: PeerName,
    peers: BTreeMap<PeerName, String>,
    unreachable: Arc<Mutex<BTreeSet<PeerName>>>,
    outbox: mpsc::Sender<Outbound>,
}

impl HttpGossip {
    /// Creates the transport and starts its delivery task.
    ///
    /// # Errors
    ///
    /// The HTTP client cannot be built.
    pub fn spawn(
        our_name: PeerName,
        peers: BTreeMap<PeerName, String>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), ServerError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let transport = Arc::new(Self {
            our_name,
            peers,
            unreachable: Arc::default(),
            outbox,
        });
        let delivery = Delivery {
            client,
            our_name: transport.our_name.clone(),
            peers: transport.peers.clone(),
            unreachable: Arc::clone(&transport.unreachable),
        };
        let task = tokio::spawn(delivery.run(rx));
        Ok((transport, task))
    }

    fn enqueue(&self, msg: Outbound) -> bool {
        match self.outbox.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Gossip outbox full; dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Gossip delivery task stopped; dropping message");
                false
            }
        }
    }
}

impl GossipTransport for HttpGossip {
    fn gossip_unicast(&self, dest: &PeerName, msg: Vec<u8>) -> Result<(), GossipError> {
        if !self.peers.contains_key(dest) {
            return Err(GossipError::UnknownPeer(dest.clone()));
        }
        if lock(&self.unreachable).contains(dest) {
            return Err(GossipError::Unreachable {
                peer: dest.clone(),
                reason: "last delivery failed".to_string(),
            });
        }
        if self.enqueue(Outbound::Unicast {
            dest: dest.clone(),
            payload: msg,
        }) {
            Ok(())
        } else {
            Err(GossipError::Unreachable {
                peer: dest.clone(),
                reason: "outbox unavailable".to_string(),
            })
        }
    }

    fn gossip_broadcast(&self, msg: Vec<u8>) {
        if !self.peers.is_empty() {
            self.enqueue(Outbound::Broadcast(msg));
        }
    }

    fn is_known_peer(&self, peer: &PeerName) -> bool {
        self.peers.contains_key(peer) && !lock(&self.unreachable).contains(peer)
    }
}

fn lock(set: &Mutex<BTreeSet<PeerName>>) -> MutexGuard<'_, BTreeSet<PeerName>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Delivery {
    client: Client,
    our_name: PeerName,
    peers: BTreeMap<PeerName, String>,
    unreachable: Arc<Mutex<BTreeSet<PeerName>>>,
}

impl Delivery {
    async fn run(self, mut rx: mpsc::Receiver<Outbound>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Outbound::Unicast { dest, payload } => self.post(&dest, "unicast", payload).await,
                Outbound::Broadcast(payload) => {
                    for dest in self.peers.keys() {
                        self.post(dest, "broadcast", payload.clone()).await;
                    }
                }
            }
        }
        debug!("Gossip delivery task stopped");
    }

    async fn post(&self, dest: &PeerName, kind: &str, payload: Vec<u8>) {
        let Some(base) = self.peers.get(dest) else {
            return;
        };
        let url = format!("{base}/gossip/{kind}");
        let result = self
            .client
            .post(&url)
            .header(PEER_HEADER, self.our_name.as_str())
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await;

        let failure = match result {
            Ok(response) if response.status().is_success() => None,
            Ok(response) => Some(format!("HTTP {}", response.status())),
            Err(e) => Some(e.to_string()),
        };
        let mut unreachable = lock(&self.unreachable);
        match failure {
            None => {
                if unreachable.remove(dest) {
                    info!(peer = %dest, "Peer reachable again");
                }
            }
            Some(reason) => {
                if unreachable.insert(dest.clone()) {
                    warn!(peer = %dest, url = %url, "Gossip delivery failed: {}", reason);
                } else {
                    debug!(peer = %dest, "Gossip delivery failed again: {}", reason);
                }
            }
        }
    }
}

/// Broadcasts the allocator's state every `every` until the allocator stops.
pub fn spawn_periodic_gossip(
    handle: AllocatorHandle,
    transport: Arc<HttpGossip>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match handle.encode().await {
                Ok(payload) => transport.gossip_broadcast(payload),
                Err(AllocatorError::ShuttingDown) => break,
                Err(e) => warn!("Failed to encode gossip state: {}", e),
            }
        }
        debug!("Periodic gossip stopped");
    })
}
