//! The allocator: ring, local space and ownership records, driven one event
//! at a time.
//!
//! Every public method is one event. Operations that cannot finish yet
//! (no ring, no free space, address owned elsewhere) are parked in pending
//! queues and retried after later events; their result is delivered on the
//! `oneshot` sender passed in. The actor in [`crate::actor`] serializes
//! calls; tests drive the allocator directly.

use crate::address::{Address, Cidr, Count, Range, u128_string};
use crate::clock::Clock;
use crate::db::Db;
use crate::error::AllocatorError;
use crate::gossip::{GossipData, GossipError, GossipTransport, PROTOCOL_VERSION, UnicastMessage};
use crate::paxos::{Node, Participant};
use crate::peer::PeerName;
use crate::ring::Ring;
use crate::space::{RangeSet, Space};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// How often the actor retries stalled work.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Grace period before a dead container's addresses are released.
pub const CONTAINER_DIED_TIMEOUT_SECS: i64 = 30;

const MAX_CLOCK_SKEW_SECS: i64 = 3600;

const PEER_NAME_KEY: &str = "peername";
const RING_KEY: &str = "ring";
const OWNED_KEY: &str = "ownedAddresses";

/// Returns true once the caller has given up on an operation.
pub type CancelFn = Box<dyn Fn() -> bool + Send>;

pub type AllocateReply = oneshot::Sender<Result<Address, AllocatorError>>;
pub type ClaimReply = oneshot::Sender<Result<(), AllocatorError>>;

/// An address known to belong to an identity before the allocator started.
#[derive(Debug, Clone)]
pub struct PreClaim {
    pub ident: String,
    pub is_container: bool,
    pub cidr: Cidr,
}

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// This peer's name on the ring
    pub our_name: PeerName,
    /// Paxos identity, distinct across restarts of the same peer
    pub our_uid: u64,
    /// Human-readable label shown in status output
    pub our_nickname: String,
    /// Whole address range shared by all peers
    pub universe: Cidr,
    /// Initial peer set; when non-empty the ring is built without Paxos.
    pub seed: Vec<PeerName>,
    /// Acceptors needed before the ring is created
    pub quorum: usize,
    /// Observers never propose or accept; they wait for someone else's ring
    pub is_observer: bool,
    /// Addresses to claim as soon as the ring exists
    pub pre_claims: Vec<PreClaim>,
}

impl AllocatorConfig {
    /// An elector with quorum 1 and a random Paxos identity.
    #[must_use]
    pub fn new(our_name: PeerName, universe: Cidr) -> Self {
        Self {
            our_nickname: our_name.to_string(),
            our_uid: uuid::Uuid::new_v4().as_u64_pair().0,
            our_name,
            universe,
            seed: Vec::new(),
            quorum: 1,
            is_observer: false,
            pre_claims: Vec::new(),
        }
    }
}

/// Quorum for `peers` electors.
#[must_use]
pub fn quorum_for(peers: usize) -> usize {
    peers / 2 + 1
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct OwnedData {
    is_container: bool,
    cidrs: Vec<Cidr>,
}

struct Pending<T> {
    reply: Option<oneshot::Sender<T>>,
    cancel: Option<CancelFn>,
}

impl<T> Pending<T> {
    fn new(reply: Option<oneshot::Sender<T>>, cancel: Option<CancelFn>) -> Self {
        Self { reply, cancel }
    }

    /// A dropped receiver counts as cancellation.
    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|f| f())
            || self.reply.as_ref().is_some_and(oneshot::Sender::is_closed)
    }

    /// Replies at most once.
    fn send(&mut self, value: T) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(value);
        }
    }
}

struct AllocateOp {
    ident: String,
    subnet: Cidr,
    is_container: bool,
    pending: Pending<Result<Address, AllocatorError>>,
}

impl AllocateOp {
    fn cancel(&mut self) {
        let ident = self.ident.clone();
        self.pending
            .send(Err(AllocatorError::Cancelled { op: "allocate", ident }));
    }
}

struct ClaimOp {
    ident: String,
    cidr: Cidr,
    is_container: bool,
    no_error_on_unknown: bool,
    pending: Pending<Result<(), AllocatorError>>,
}

impl ClaimOp {
    fn cancel(&mut self) {
        let ident = self.ident.clone();
        self.pending
            .send(Err(AllocatorError::Cancelled { op: "claim", ident }));
    }

    fn denied_by(&mut self, owner: &PeerName, nickname: Option<&String>) {
        let peer = match nickname {
            Some(nick) => format!("{owner} ({nick})"),
            None => owner.to_string(),
        };
        self.pending.send(Err(AllocatorError::AddressOwnedByPeer {
            addr: self.cidr.to_string(),
            peer,
        }));
    }
}

struct PrimeOp {
    pending: Pending<Result<(), AllocatorError>>,
}

/// One contiguous range in the diagnostic view of the ring.
#[derive(Debug, Clone, Serialize)]
pub struct RangeStatus {
    pub peer: PeerName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub start: String,
    pub last: String,
    #[serde(with = "u128_string")]
    pub size: Count,
    pub version: u32,
}

/// Snapshot served by the diagnostics endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatorStatus {
    /// Reporting peer
    pub peer: PeerName,
    /// Its nickname
    pub nickname: String,
    /// Universe CIDR as text
    pub universe: String,
    /// True while the ring is still being agreed through Paxos
    pub awaiting_consensus: bool,
    /// Addresses in the ranges this peer owns
    #[serde(with = "u128_string")]
    pub num_owned: Count,
    /// Of those, addresses not allocated to anyone
    #[serde(with = "u128_string")]
    pub num_free: Count,
    /// Allocate requests waiting for the ring or for free space
    pub pending_allocates: usize,
    /// Claim requests not yet resolved
    pub pending_claims: usize,
    /// Ownership of every range on the ring
    pub ring: Vec<RangeStatus>,
}

pub struct Allocator {
    our_name: PeerName,
    our_nickname: String,
    universe: Cidr,
    seed: Vec<PeerName>,
    quorum: usize,
    ring: Ring,
    space: Space,
    owned: BTreeMap<String, OwnedData>,
    nicknames: BTreeMap<PeerName, String>,
    paxos: Option<Participant>,
    awaiting_consensus: bool,
    dead: HashMap<String, DateTime<Utc>>,
    pending_primes: Vec<PrimeOp>,
    pending_claims: Vec<ClaimOp>,
    pending_allocates: Vec<AllocateOp>,
    shutting_down: bool,
    ring_changed: bool,
    gossip: Arc<dyn GossipTransport>,
    db: Arc<dyn Db>,
    clock: Arc<dyn Clock>,
}

impl Allocator {
    #[must_use]
    pub fn new(
        config: AllocatorConfig,
        gossip: Arc<dyn GossipTransport>,
        db: Arc<dyn Db>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let paxos = if config.is_observer {
            Participant::Observer
        } else {
            Participant::Node(Node::new(config.our_name.clone(), config.our_uid, config.quorum))
        };
        let range = config.universe.range();
        let pending_claims = config
            .pre_claims
            .into_iter()
            .map(|c| ClaimOp {
                ident: c.ident,
                cidr: c.cidr,
                is_container: c.is_container,
                no_error_on_unknown: false,
                pending: Pending::new(None, None),
            })
            .collect();

        Self {
            ring: Ring::new(range.start, range.end, config.our_name.clone()),
            nicknames: BTreeMap::from([(config.our_name.clone(), config.our_nickname.clone())]),
            our_name: config.our_name,
            our_nickname: config.our_nickname,
            universe: config.universe,
            seed: config.seed,
            quorum: config.quorum,
            space: Space::new(),
            owned: BTreeMap::new(),
            paxos: Some(paxos),
            awaiting_consensus: false,
            dead: HashMap::new(),
            pending_primes: Vec::new(),
            pending_claims,
            pending_allocates: Vec::new(),
            shutting_down: false,
            ring_changed: false,
            gossip,
            db,
            clock,
        }
    }

    #[must_use]
    pub fn our_name(&self) -> &PeerName {
        &self.our_name
    }

    #[must_use]
    pub fn universe(&self) -> Cidr {
        self.universe
    }

    #[must_use]
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    #[must_use]
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Loads persisted state, or builds the ring from the seed.
    ///
    /// # Errors
    ///
    /// `Persistence` when the store cannot be read or rewritten; the peer
    /// must not join without it.
    pub fn start(&mut self) -> Result<(), AllocatorError> {
        let loaded = self.load_persisted_data()?;
        let elector = self.paxos.as_ref().is_some_and(Participant::is_elector);
        match (loaded, self.seed.is_empty()) {
            (true, false) => info!(peer = %self.our_name, "Found persisted IPAM data, ignoring supplied seed"),
            (true, true) => info!(peer = %self.our_name, "Initialising with persisted data"),
            (false, false) => {
                info!(peer = %self.our_name, "Initialising with supplied IPAM seed");
                self.create_ring(self.seed.clone());
            }
            (false, true) if elector => info!(peer = %self.our_name, "Initialising via deferred consensus"),
            (false, true) => {
                info!(peer = %self.our_name, "Initialising as observer, awaiting IPAM data from another peer");
            }
        }
        if loaded {
            self.try_pending_ops();
        }
        self.finish_event();
        Ok(())
    }

    /// Allocates an address for `ident` inside `subnet`.
    pub fn allocate(
        &mut self,
        ident: &str,
        subnet: Cidr,
        is_container: bool,
        cancel: Option<CancelFn>,
        reply: AllocateReply,
    ) {
        let mut op = AllocateOp {
            ident: ident.to_string(),
            subnet,
            is_container,
            pending: Pending::new(Some(reply), cancel),
        };
        if self.shutting_down {
            op.pending.send(Err(AllocatorError::ShuttingDown));
        } else if !self.try_allocate(&mut op) {
            self.pending_allocates.push(op);
        }
        self.finish_event();
    }

    /// Claims a specific address for `ident`.
    pub fn claim(
        &mut self,
        ident: &str,
        cidr: Cidr,
        is_container: bool,
        no_error_on_unknown: bool,
        cancel: Option<CancelFn>,
        reply: ClaimReply,
    ) {
        let mut op = ClaimOp {
            ident: ident.to_string(),
            cidr,
            is_container,
            no_error_on_unknown,
            pending: Pending::new(Some(reply), cancel),
        };
        if self.shutting_down {
            op.pending.send(Err(AllocatorError::ShuttingDown));
        } else if !self.try_claim(&mut op) {
            self.pending_claims.push(op);
        }
        self.finish_event();
    }

    /// Replies once a ring exists.
    pub fn prime(&mut self, reply: ClaimReply) {
        let mut op = PrimeOp {
            pending: Pending::new(Some(reply), None),
        };
        if self.shutting_down {
            op.pending.send(Err(AllocatorError::ShuttingDown));
        } else if !self.try_prime(&mut op) {
            self.pending_primes.push(op);
        }
        self.finish_event();
    }

    /// Addresses held by `ident` inside `range`.
    #[must_use]
    pub fn lookup(&self, ident: &str, range: &Range) -> Vec<Cidr> {
        self.owned_in_range(ident, range)
    }

    /// Releases every address held by `ident`.
    ///
    /// # Errors
    ///
    /// `NotFound` when `ident` holds nothing.
    pub fn delete(&mut self, ident: &str) -> Result<(), AllocatorError> {
        let result = self.delete_ident(ident);
        self.finish_event();
        result
    }

    /// Releases one address held by `ident`.
    ///
    /// # Errors
    ///
    /// `NotFound` when `ident` does not hold `addr`.
    pub fn free(&mut self, ident: &str, addr: Address) -> Result<(), AllocatorError> {
        let result = if self.remove_owned(ident, addr) {
            debug!(peer = %self.our_name, "Freed {} for {}", self.universe.ip(addr), ident);
            if let Err(err) = self.space.free(addr) {
                error!(peer = %self.our_name, "Freeing {}: {}", self.universe.ip(addr), err);
            }
            Ok(())
        } else {
            Err(AllocatorError::NotFound(format!(
                "address {} not found for {}",
                self.universe.ip(addr),
                ident
            )))
        };
        self.finish_event();
        result
    }

    /// Notes a container death; its addresses are kept for the grace period.
    pub fn container_died(&mut self, ident: &str) {
        if self.has_owned_by_container(ident) {
            debug!(peer = %self.our_name, "Container {} died; noting to remove later", ident);
            self.dead.insert(ident.to_string(), self.clock.now());
        }
        self.cancel_ops_for(ident);
        self.finish_event();
    }

    /// Releases a destroyed container's addresses immediately.
    pub fn container_destroyed(&mut self, ident: &str) {
        if self.has_owned_by_container(ident) {
            debug!(peer = %self.our_name, "Container {} destroyed; removing addresses", ident);
            let _ = self.delete_ident(ident);
            self.dead.remove(ident);
        }
        self.finish_event();
    }

    /// A container came back within the grace period.
    pub fn container_started(&mut self, ident: &str) {
        self.dead.remove(ident);
        self.finish_event();
    }

    /// Drops container records whose identity is not in `ids`; returns the
    /// identities removed.
    pub fn prune_owned(&mut self, ids: &[String]) -> Vec<String> {
        let stale: Vec<String> = self
            .owned
            .iter()
            .filter(|(ident, data)| data.is_container && !ids.contains(ident))
            .map(|(ident, _)| ident.clone())
            .collect();
        for ident in &stale {
            if let Some(data) = self.owned.remove(ident) {
                debug!(peer = %self.our_name, "Deleting old entry {}: {:?}", ident, data.cidrs);
                for cidr in data.cidrs {
                    if let Err(err) = self.space.free(cidr.addr) {
                        error!(peer = %self.our_name, "Freeing {}: {}", cidr, err);
                    }
                }
            }
        }
        if !stale.is_empty() {
            self.persist_owned();
        }
        self.finish_event();
        stale
    }

    /// Cancels pending work and hands our ranges to another peer.
    pub fn shutdown(&mut self) {
        info!(peer = %self.our_name, "Shutdown");
        self.shutting_down = true;
        for mut op in std::mem::take(&mut self.pending_claims) {
            op.cancel();
        }
        for mut op in std::mem::take(&mut self.pending_allocates) {
            op.cancel();
        }
        for mut op in std::mem::take(&mut self.pending_primes) {
            op.pending.send(Err(AllocatorError::ShuttingDown));
        }
        let heir = self.pick_peer_for_transfer();
        self.space.clear();
        if let Some(heir) = heir {
            info!(peer = %self.our_name, "Transferring our ranges to {}", heir);
            let ours = self.our_name.clone();
            self.ring.transfer(&ours, &heir);
            self.persist_ring();
            self.broadcast();
        }
    }

    /// Takes over every range owned by a peer, named by peer name or
    /// nickname. Returns the number of addresses gained.
    pub fn admin_takeover(&mut self, peer_name_or_nickname: &str) -> Count {
        let peer = self.lookup_peer_name(peer_name_or_nickname);
        if peer == self.our_name {
            warn!(peer = %self.our_name, "Attempt to take over range from ourself");
            return 0;
        }
        debug!(peer = %self.our_name, "Admin takeover of ranges owned by {}", peer);

        let ours = self.our_name.clone();
        let before = self.space.num_free();
        if self.ring.transfer(&peer, &ours).is_empty() {
            warn!(peer = %self.our_name, "Attempt to take over range from unknown peer {}", peer_name_or_nickname);
            return 0;
        }
        self.ring_updated();
        let after = self.space.num_free();
        self.broadcast();
        self.finish_event();
        after.saturating_sub(before)
    }

    /// Forgets the nickname of a departed peer that owns nothing.
    pub fn peer_gone(&mut self, peer: &PeerName) {
        debug!(peer = %self.our_name, "Peer gone: {}", peer);
        if !self.ring.peer_names().contains(peer) {
            self.nicknames.remove(peer);
        }
    }

    /// Handles a broadcast from `sender`.
    ///
    /// # Errors
    ///
    /// `Decode` for malformed payloads (nothing changes) and `RingProtocol`
    /// when the incoming ring conflicts with ours.
    pub fn on_gossip_broadcast(&mut self, sender: &PeerName, payload: &[u8]) -> Result<(), AllocatorError> {
        let data = match GossipData::decode(payload) {
            Ok(data) => data,
            Err(err) => {
                warn!(peer = %self.our_name, "Dropping broadcast from {}: {}", sender, err);
                return Err(err);
            }
        };
        let result = self.update(sender, data);
        self.finish_event();
        result
    }

    /// Handles a unicast from `sender`.
    ///
    /// # Errors
    ///
    /// As for [`Allocator::on_gossip_broadcast`].
    pub fn on_gossip_unicast(&mut self, sender: &PeerName, payload: &[u8]) -> Result<(), AllocatorError> {
        let msg = match UnicastMessage::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(peer = %self.our_name, "Dropping unicast from {}: {}", sender, err);
                return Err(err);
            }
        };
        let result = match msg {
            UnicastMessage::SpaceRequest(range) => {
                debug!(peer = %self.our_name, "Peer {} asked me for space", sender);
                // without a ring there is nothing to give; they will ask again
                if !self.ring.is_empty() {
                    self.donate_space(range, sender);
                }
                Ok(())
            }
            UnicastMessage::SpaceRequestDenied(range) => {
                self.space_request_denied(sender, &range);
                Ok(())
            }
            UnicastMessage::RingUpdate(data) => self.update(sender, data),
        };
        self.finish_event();
        result
    }

    /// Our current gossip state, encoded.
    ///
    /// # Errors
    ///
    /// Serialization failures.
    pub fn encode(&self) -> Result<Vec<u8>, AllocatorError> {
        self.gossip_data().encode()
    }

    /// Periodic retry of consensus, pending operations and dead containers.
    pub fn tick(&mut self) {
        if self.awaiting_consensus {
            self.propose();
        } else if self.has_pending_ops() {
            if self.ring.is_empty() {
                self.establish_ring();
            } else {
                self.try_pending_ops();
            }
        }
        self.remove_dead_containers();
        self.finish_event();
    }

    #[must_use]
    pub fn status(&self) -> AllocatorStatus {
        let ring = self
            .ring
            .all_range_info()
            .into_iter()
            .map(|info| RangeStatus {
                nickname: self.nicknames.get(&info.peer).cloned(),
                peer: info.peer,
                start: self.universe.ip(info.range.start).to_string(),
                last: self.universe.ip(Address(info.range.end.0 - 1)).to_string(),
                size: info.range.size(),
                version: info.version,
            })
            .collect();
        AllocatorStatus {
            peer: self.our_name.clone(),
            nickname: self.our_nickname.clone(),
            universe: self.universe.to_string(),
            awaiting_consensus: self.awaiting_consensus,
            num_owned: self.space.num_owned(),
            num_free: self.space.num_free(),
            pending_allocates: self.pending_allocates.len(),
            pending_claims: self.pending_claims.len(),
            ring,
        }
    }

    // Operations

    fn try_allocate(&mut self, op: &mut AllocateOp) -> bool {
        if op.pending.cancelled() {
            op.cancel();
            return true;
        }

        if let Some(cidr) = self.owned_in_range(&op.ident, &op.subnet.range()).first() {
            // an allocation for a container we heard had died resurrects it
            self.dead.remove(&op.ident);
            op.pending.send(Ok(cidr.addr));
            return true;
        }

        if !self.universe.range().overlaps(&op.subnet.range()) {
            op.pending.send(Err(AllocatorError::OutOfUniverse(op.subnet.to_string())));
            return true;
        }

        self.establish_ring();
        if let Some(addr) = self.space.allocate(&op.subnet.host_range()) {
            debug!(peer = %self.our_name, "Allocated {} for {} in {}", self.universe.ip(addr), op.ident, op.subnet);
            self.add_owned(&op.ident, op.subnet.with_addr(addr), op.is_container);
            op.pending.send(Ok(addr));
            return true;
        }

        let range = op.subnet.range();
        for donor in self.ring.choose_peers_to_ask_for_space(&range) {
            match self.send_unicast(&donor, UnicastMessage::SpaceRequest(range)) {
                Ok(()) => break,
                Err(err) => debug!(peer = %self.our_name, "Error sending space request to {}: {}", donor, err),
            }
        }
        false
    }

    fn try_claim(&mut self, op: &mut ClaimOp) -> bool {
        if op.pending.cancelled() {
            op.cancel();
            return true;
        }

        let addr = op.cidr.addr;
        if !self.ring.contains(addr) {
            op.pending.send(Err(AllocatorError::OutOfUniverse(op.cidr.to_string())));
            return true;
        }

        self.establish_ring();
        match self.ring.owner(addr).cloned() {
            None => {
                if op.no_error_on_unknown {
                    info!(peer = %self.our_name, "Claim {} for {}: address allocator still initializing; will try later", op.cidr, op.ident);
                    op.pending.send(Ok(()));
                } else {
                    debug!(peer = %self.our_name, "Claim {} for {}: address allocator still initializing; will try later", op.cidr, op.ident);
                }
                return false;
            }
            Some(owner) if owner != self.our_name => {
                debug!(peer = %self.our_name, "Requesting address {} from other peer {}", op.cidr, owner);
                let request = UnicastMessage::SpaceRequest(Range::new(addr, addr + 1));
                if let Err(err) = self.send_unicast(&owner, request) {
                    if op.no_error_on_unknown {
                        info!(peer = %self.our_name, "Claim {} for {}: {}; will try later", op.cidr, op.ident, err);
                        op.pending.send(Ok(()));
                    } else {
                        op.denied_by(&owner, self.nicknames.get(&owner));
                        return true;
                    }
                }
                return false;
            }
            Some(_) => {}
        }

        match self.find_owner(addr) {
            None => match self.space.claim(addr) {
                Ok(()) => {
                    debug!(peer = %self.our_name, "Claimed {} for {}", op.cidr, op.ident);
                    self.add_owned(&op.ident, op.cidr, op.is_container);
                    op.pending.send(Ok(()));
                }
                Err(err) => op.pending.send(Err(err.into())),
            },
            Some(existing) if existing == op.ident => {
                debug!(peer = %self.our_name, "Re-claimed {} for {}", op.cidr, op.ident);
                op.pending.send(Ok(()));
            }
            Some(existing) => op.pending.send(Err(AllocatorError::AddressInUse {
                addr: op.cidr.to_string(),
                owner: existing,
            })),
        }
        true
    }

    fn try_prime(&mut self, op: &mut PrimeOp) -> bool {
        if self.ring.is_empty() {
            self.establish_ring();
        }
        if self.ring.is_empty() {
            return false;
        }
        op.pending.send(Ok(()));
        true
    }

    fn try_pending_ops(&mut self) {
        // primes first, then claims before new allocations
        self.retry(pending_primes, Self::try_prime);
        self.retry(pending_claims, Self::try_claim);
        self.retry(pending_allocates, Self::try_allocate);
    }

    fn retry<T>(&mut self, queue: fn(&mut Self) -> &mut Vec<T>, try_op: fn(&mut Self, &mut T) -> bool) {
        let ops = std::mem::take(queue(self));
        let mut kept = Vec::with_capacity(ops.len());
        for mut op in ops {
            if !try_op(self, &mut op) {
                kept.push(op);
            }
        }
        let queue = queue(self);
        kept.append(queue);
        *queue = kept;
    }

    fn has_pending_ops(&self) -> bool {
        !(self.pending_primes.is_empty() && self.pending_claims.is_empty() && self.pending_allocates.is_empty())
    }

    fn cancel_ops_for(&mut self, ident: &str) {
        let (mut gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_allocates)
            .into_iter()
            .partition(|op| op.ident == ident);
        self.pending_allocates = kept;
        for op in &mut gone {
            op.cancel();
        }
        let (mut gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_claims)
            .into_iter()
            .partition(|op| op.ident == ident);
        self.pending_claims = kept;
        for op in &mut gone {
            op.cancel();
        }
    }

    fn space_request_denied(&mut self, sender: &PeerName, range: &Range) {
        let (mut denied, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_claims)
            .into_iter()
            .partition(|op| range.contains(op.cidr.addr));
        self.pending_claims = kept;
        for op in &mut denied {
            op.denied_by(sender, self.nicknames.get(sender));
        }
    }

    fn remove_dead_containers(&mut self) {
        let cutoff = self.clock.now() - Duration::seconds(CONTAINER_DIED_TIMEOUT_SECS);
        let expired: Vec<String> = self
            .dead
            .iter()
            .filter(|(_, died)| **died < cutoff)
            .map(|(ident, _)| ident.clone())
            .collect();
        for ident in expired {
            if self.delete_ident(&ident).is_ok() {
                debug!(peer = %self.our_name, "Removed addresses for container {}", ident);
            }
            self.dead.remove(&ident);
        }
    }

    fn delete_ident(&mut self, ident: &str) -> Result<(), AllocatorError> {
        let cidrs = self.remove_all_owned(ident);
        if cidrs.is_empty() {
            return Err(AllocatorError::NotFound(format!("no addresses for {ident}")));
        }
        for cidr in cidrs {
            if let Err(err) = self.space.free(cidr.addr) {
                error!(peer = %self.our_name, "Freeing {}: {}", cidr, err);
            }
        }
        Ok(())
    }

    fn pick_peer_for_transfer(&self) -> Option<PeerName> {
        let known = |p: &PeerName| self.gossip.is_known_peer(p);
        let any = |_: &PeerName| true;
        self.ring
            .pick_peer_for_transfer(known)
            .or_else(|| self.pick_peer_from_nicknames(known))
            .or_else(|| self.ring.pick_peer_for_transfer(any))
            .or_else(|| self.pick_peer_from_nicknames(any))
    }

    fn pick_peer_from_nicknames(&self, is_valid: impl Fn(&PeerName) -> bool) -> Option<PeerName> {
        self.nicknames
            .keys()
            .find(|name| **name != self.our_name && is_valid(name))
            .cloned()
    }

    fn lookup_peer_name(&self, name: &str) -> PeerName {
        self.nicknames
            .iter()
            .find(|(_, nickname)| nickname.as_str() == name)
            .map_or_else(|| PeerName::new(name), |(peer, _)| peer.clone())
    }

    // Gossip

    fn update(&mut self, sender: &PeerName, data: GossipData) -> Result<(), AllocatorError> {
        let skew = (self.clock.now().timestamp() - data.now).abs();
        if skew > MAX_CLOCK_SKEW_SECS {
            warn!(peer = %self.our_name, "Clock of {} differs from ours by {}s", sender, skew);
        }

        self.nicknames.extend(data.nicknames);

        if let Some(ring) = data.ring {
            match self.ring.merge(&ring) {
                Ok(true) => {
                    self.prune_nicknames();
                    self.ring_updated();
                }
                Ok(false) => {}
                Err(err) => {
                    error!(peer = %self.our_name, "Rejected ring from {}: {}", sender, err);
                    return Err(err.into());
                }
            }
        } else if !self.ring.is_empty() {
            // the sender is still electing or is an observer asking for a ring
            self.send_ring_update(sender);
        } else if let Some(state) = data.paxos {
            let Some(paxos) = self.paxos.as_mut() else {
                return Ok(());
            };
            if paxos.update(&state) {
                if paxos.think() {
                    self.broadcast();
                }
                if let Some(consensus) = self.paxos.as_ref().and_then(Participant::consensus) {
                    self.create_ring(consensus.value);
                }
            }
        } else if self.paxos.as_ref().is_some_and(Participant::is_elector) {
            self.establish_ring();
        }
        Ok(())
    }

    fn prune_nicknames(&mut self) {
        let ring_peers = self.ring.peer_names();
        let gossip = Arc::clone(&self.gossip);
        let ours = self.our_name.clone();
        self.nicknames
            .retain(|name, _| *name == ours || ring_peers.contains(name) || gossip.is_known_peer(name));
    }

    fn gossip_data(&self) -> GossipData {
        let empty = self.ring.is_empty();
        GossipData {
            version: PROTOCOL_VERSION,
            now: self.clock.now().timestamp(),
            nicknames: self.nicknames.clone(),
            paxos: if empty {
                self.paxos.as_ref().and_then(Participant::gossip_state).cloned()
            } else {
                None
            },
            ring: (!empty).then(|| self.ring.clone()),
        }
    }

    fn broadcast(&self) {
        match self.encode() {
            Ok(bytes) => self.gossip.gossip_broadcast(bytes),
            Err(err) => error!(peer = %self.our_name, "Encoding gossip: {}", err),
        }
    }

    fn send_unicast(&self, dest: &PeerName, msg: UnicastMessage) -> Result<(), GossipError> {
        let bytes = msg.encode().map_err(|err| GossipError::Unreachable {
            peer: dest.clone(),
            reason: err.to_string(),
        })?;
        self.gossip.gossip_unicast(dest, bytes)
    }

    fn send_ring_update(&self, dest: &PeerName) {
        if let Err(err) = self.send_unicast(dest, UnicastMessage::RingUpdate(self.gossip_data())) {
            debug!(peer = %self.our_name, "Sending ring update to {}: {}", dest, err);
        }
    }

    fn donate_space(&mut self, range: Range, to: &PeerName) {
        match self.space.donate(&range) {
            None => {
                debug!(peer = %self.our_name, "No space to give to peer {}", to);
                if let Err(err) = self.send_unicast(to, UnicastMessage::SpaceRequestDenied(range)) {
                    debug!(peer = %self.our_name, "Sending denial to {}: {}", to, err);
                }
            }
            Some(chunk) => {
                debug!(
                    peer = %self.our_name,
                    "Giving range {}-{} to {}",
                    self.universe.ip(chunk.start),
                    self.universe.ip(Address(chunk.end.0 - 1)),
                    to
                );
                self.ring.grant_range_to_host(chunk.start, chunk.end, to);
                self.persist_ring();
            }
        }
        // the requester learns what it got, or where else to look
        self.send_ring_update(to);
    }

    // Ring lifecycle

    fn establish_ring(&mut self) {
        if !self.ring.is_empty() || self.awaiting_consensus {
            return;
        }
        let Some(paxos) = self.paxos.as_mut() else {
            return;
        };
        self.awaiting_consensus = true;
        paxos.set_quorum(self.quorum);
        self.propose();
        // with a quorum of one, proposing decides immediately
        if let Some(consensus) = self.paxos.as_ref().and_then(Participant::consensus) {
            self.create_ring(consensus.value);
        }
    }

    fn propose(&mut self) {
        debug!(peer = %self.our_name, "Paxos proposing");
        if let Some(paxos) = self.paxos.as_mut() {
            paxos.propose();
        }
        self.broadcast();
    }

    fn create_ring(&mut self, mut peers: Vec<PeerName>) {
        peers.sort();
        peers.dedup();
        info!(peer = %self.our_name, "Creating ring for peers {:?}", peers);
        self.ring.claim_for_peers(&peers);
        self.ring_updated();
        self.broadcast();
    }

    fn ring_updated(&mut self) {
        if self.awaiting_consensus {
            self.awaiting_consensus = false;
            self.paxos = None;
        }
        self.persist_ring();
        self.space.update_ranges(&self.ring.owned_ranges());
        self.ring_changed = true;
    }

    /// Runs after every event: drains work unblocked by ring changes, checks
    /// ring and space agree, and reports free space into the ring.
    fn finish_event(&mut self) {
        while self.ring_changed {
            self.ring_changed = false;
            self.try_pending_ops();
        }
        if self.shutting_down {
            return;
        }
        self.check_invariants();
        self.report_free_space();
    }

    fn check_invariants(&self) {
        let ring_ranges = RangeSet::from_ranges(&self.ring.owned_ranges());
        if ring_ranges.ranges() != self.space.owned_ranges() {
            error!(
                peer = %self.our_name,
                "Ring and space disagree: ring {:?}, space {:?}",
                ring_ranges.ranges(),
                self.space.owned_ranges()
            );
        }
    }

    fn report_free_space(&mut self) {
        let ranges = self.ring.owned_ranges();
        if ranges.is_empty() {
            return;
        }
        let free = ranges
            .iter()
            .map(|r| (r.start, self.space.num_free_in_range(r)))
            .collect();
        if self.ring.report_free(free) {
            self.persist_ring();
        }
    }

    // Persistence

    fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), AllocatorError> {
        let bytes = serde_json::to_vec(value).map_err(|e| AllocatorError::Persistence(e.to_string()))?;
        self.db
            .save(key, &bytes)
            .map_err(|e| AllocatorError::Persistence(e.to_string()))
    }

    fn load<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, AllocatorError> {
        let Some(bytes) = self
            .db
            .load(key)
            .map_err(|e| AllocatorError::Persistence(e.to_string()))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| AllocatorError::Persistence(format!("decoding {key}: {e}")))
    }

    fn save_ring(&self) -> Result<(), AllocatorError> {
        self.save(PEER_NAME_KEY, &self.our_name)?;
        self.save(RING_KEY, &self.ring)
    }

    fn persist_ring(&self) {
        if let Err(err) = self.save_ring() {
            error!(peer = %self.our_name, "Error persisting ring data: {}", err);
        }
    }

    fn persist_owned(&self) {
        if let Err(err) = self.save(OWNED_KEY, &self.owned) {
            error!(peer = %self.our_name, "Error persisting address data: {}", err);
        }
    }

    /// Returns true if persisted data was adopted.
    fn load_persisted_data(&mut self) -> Result<bool, AllocatorError> {
        let name: Option<PeerName> = self.load(PEER_NAME_KEY)?;
        let ring: Option<Ring> = self.load(RING_KEY)?;
        let owned: Option<BTreeMap<String, OwnedData>> = self.load(OWNED_KEY)?;

        let reason = match (&name, &ring) {
            (Some(name), Some(_)) if *name != self.our_name => {
                Some(format!("Deleting persisted data for peername {name}"))
            }
            (Some(_), Some(ring)) if ring.range() != self.universe.range() => Some(format!(
                "Deleting persisted data for IPAM range {}-{}; our range is {}",
                self.universe.ip(ring.start),
                self.universe.ip(Address(ring.end.0 - 1)),
                self.universe
            )),
            (Some(_), Some(_)) => None,
            _ => Some("No valid persisted data".to_string()),
        };
        if let Some(reason) = reason {
            info!(peer = %self.our_name, "{}", reason);
            self.save_ring()?;
            self.save(OWNED_KEY, &self.owned)?;
            return Ok(false);
        }

        if let Some(ring) = ring {
            self.ring.restore(ring);
        }
        self.space.update_ranges(&self.ring.owned_ranges());
        if let Some(owned) = owned {
            self.owned = owned;
            for cidr in self.owned.values().flat_map(|d| d.cidrs.iter()) {
                if let Err(err) = self.space.claim(cidr.addr) {
                    warn!(peer = %self.our_name, "Restoring {}: {}", cidr, err);
                }
            }
        }
        Ok(true)
    }

    // Ownership records

    fn has_owned_by_container(&self, ident: &str) -> bool {
        self.owned.get(ident).is_some_and(|d| d.is_container)
    }

    fn add_owned(&mut self, ident: &str, cidr: Cidr, is_container: bool) {
        let data = self.owned.entry(ident.to_string()).or_default();
        data.is_container = is_container;
        data.cidrs.push(cidr);
        self.persist_owned();
    }

    fn remove_all_owned(&mut self, ident: &str) -> Vec<Cidr> {
        let cidrs = self.owned.remove(ident).map(|d| d.cidrs).unwrap_or_default();
        self.persist_owned();
        cidrs
    }

    fn remove_owned(&mut self, ident: &str, addr: Address) -> bool {
        let Some(data) = self.owned.get_mut(ident) else {
            return false;
        };
        let Some(pos) = data.cidrs.iter().position(|c| c.addr == addr) else {
            return false;
        };
        data.cidrs.remove(pos);
        if data.cidrs.is_empty() {
            self.owned.remove(ident);
        }
        self.persist_owned();
        true
    }

    fn owned_in_range(&self, ident: &str, range: &Range) -> Vec<Cidr> {
        self.owned
            .get(ident)
            .map(|d| d.cidrs.iter().filter(|c| range.contains(c.addr)).copied().collect())
            .unwrap_or_default()
    }

    fn find_owner(&self, addr: Address) -> Option<String> {
        self.owned
            .iter()
            .find(|(_, d)| d.cidrs.iter().any(|c| c.addr == addr))
            .map(|(ident, _)| ident.clone())
    }
}

fn pending_primes(alloc: &mut Allocator) -> &mut Vec<PrimeOp> {
    &mut alloc.pending_primes
}

fn pending_claims(alloc: &mut Allocator) -> &mut Vec<ClaimOp> {
    &mut alloc.pending_claims
}

fn pending_allocates(alloc: &mut Allocator) -> &mut Vec<AllocateOp> {
    &mut alloc.pending_allocates
}
