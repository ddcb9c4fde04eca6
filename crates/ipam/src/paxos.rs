//! Single-decree Paxos over gossip, used to agree the initial peer set.
//!
//! Every node keeps what it knows of every other node's promises and
//! acceptances; gossip merges those maps and [`Node::think`] advances our
//! own claims. The decided value is the sorted list of peer names seen by
//! the first proposer to gather a quorum of promises.

use crate::peer::PeerName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Orders proposals by round, then proposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ProposalId {
    pub round: u64,
    pub proposer: u64,
}

impl ProposalId {
    /// Round zero means "no proposal".
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.round > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AcceptedValue {
    /// Peers proposed as the initial ring owners
    pub value: Vec<PeerName>,
    /// Proposal that first picked this value.
    pub origin: ProposalId,
}

/// One node's Paxos state as gossiped to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeClaims {
    /// Highest proposal this node promised not to undercut
    pub promise: ProposalId,
    /// Proposal whose value this node accepted, if any
    pub accepted: ProposalId,
    /// The accepted value
    pub accepted_val: AcceptedValue,
}

pub type GossipState = BTreeMap<PeerName, NodeClaims>;

#[derive(Debug, Clone)]
pub struct Node {
    id: PeerName,
    uid: u64,
    quorum: usize,
    knows: GossipState,
}

impl Node {
    #[must_use]
    pub fn new(id: PeerName, uid: u64, quorum: usize) -> Self {
        let mut knows = GossipState::new();
        knows.insert(id.clone(), NodeClaims::default());
        Self {
            id,
            uid,
            quorum,
            knows,
        }
    }

    pub fn set_quorum(&mut self, quorum: usize) {
        self.quorum = quorum;
    }

    #[must_use]
    pub fn gossip_state(&self) -> &GossipState {
        &self.knows
    }

    /// Merges another node's view. Returns true if ours changed.
    pub fn update(&mut self, from: &GossipState) -> bool {
        let mut changed = false;
        for (name, incoming) in from {
            match self.knows.get_mut(name) {
                Some(claims) => {
                    if claims.promise < incoming.promise {
                        claims.promise = incoming.promise;
                        changed = true;
                    }
                    if claims.accepted < incoming.accepted {
                        claims.accepted = incoming.accepted;
                        claims.accepted_val = incoming.accepted_val.clone();
                        changed = true;
                    }
                }
                None => {
                    self.knows.insert(name.clone(), incoming.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    /// Starts a new round above anything seen so far.
    pub fn propose(&mut self) {
        let round = self
            .knows
            .values()
            .map(|c| c.promise.round.max(c.accepted.round))
            .max()
            .unwrap_or(0);
        let ours = self.knows.entry(self.id.clone()).or_default();
        ours.promise = ProposalId {
            round: round + 1,
            proposer: self.uid,
        };
        self.think();
    }

    /// Advances our claims from what we know. Returns true if they changed.
    pub fn think(&mut self) -> bool {
        let before = self.knows.get(&self.id).cloned().unwrap_or_default();
        let mut ours = before.clone();

        if let Some(highest) = self.knows.values().map(|c| c.promise).max() {
            if ours.promise < highest {
                ours.promise = highest;
            }
        }
        self.knows.insert(self.id.clone(), ours.clone());

        if ours.promise.proposer == self.uid && ours.promise.is_valid() {
            let promisers: Vec<&NodeClaims> = self
                .knows
                .values()
                .filter(|c| c.promise == ours.promise)
                .collect();
            if promisers.len() >= self.quorum {
                let prior = promisers
                    .iter()
                    .filter(|c| c.accepted.is_valid())
                    .max_by_key(|c| c.accepted)
                    .map(|c| c.accepted_val.clone());
                let value = prior.unwrap_or_else(|| AcceptedValue {
                    value: self.knows.keys().cloned().collect(),
                    origin: ours.promise,
                });
                ours.accepted = ours.promise;
                ours.accepted_val = value;
            }
        } else if let Some(claims) = self
            .knows
            .values()
            .find(|c| c.accepted == ours.promise && c.accepted.is_valid())
        {
            ours.accepted = claims.accepted;
            ours.accepted_val = claims.accepted_val.clone();
        }

        let changed = ours != before;
        self.knows.insert(self.id.clone(), ours);
        changed
    }

    /// The agreed value, once a quorum accepted the same origin.
    #[must_use]
    pub fn consensus(&self) -> Option<AcceptedValue> {
        let mut counts: HashMap<ProposalId, usize> = HashMap::new();
        for claims in self.knows.values().filter(|c| c.accepted.is_valid()) {
            let count = counts.entry(claims.accepted_val.origin).or_default();
            *count += 1;
            if *count >= self.quorum {
                return Some(claims.accepted_val.clone());
            }
        }
        None
    }
}

/// A Paxos node, or an observer that never votes.
#[derive(Debug, Clone)]
pub enum Participant {
    Node(Node),
    Observer,
}

impl Participant {
    #[must_use]
    pub fn is_elector(&self) -> bool {
        matches!(self, Participant::Node(_))
    }

    pub fn set_quorum(&mut self, quorum: usize) {
        if let Participant::Node(node) = self {
            node.set_quorum(quorum);
        }
    }

    #[must_use]
    pub fn gossip_state(&self) -> Option<&GossipState> {
        match self {
            Participant::Node(node) => Some(node.gossip_state()),
            Participant::Observer => None,
        }
    }

    pub fn update(&mut self, from: &GossipState) -> bool {
        match self {
            Participant::Node(node) => node.update(from),
            Participant::Observer => false,
        }
    }

    pub fn propose(&mut self) {
        if let Participant::Node(node) = self {
            node.propose();
        }
    }

    pub fn think(&mut self) -> bool {
        match self {
            Participant::Node(node) => node.think(),
            Participant::Observer => false,
        }
    }

    #[must_use]
    pub fn consensus(&self) -> Option<AcceptedValue> {
        match self {
            Participant::Node(node) => node.consensus(),
            Participant::Observer => None,
        }
    }
}
