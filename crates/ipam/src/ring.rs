//! Ring of address-range ownership.
//!
//! The universe `[start, end)` is split by tokens; each entry owns the
//! addresses from its token up to the next token, wrapping at the end.
//! Rings from different peers converge by [`Ring::merge`], which keeps the
//! higher version of every entry.

use crate::address::{Address, Count, Range, u128_string};
use crate::peer::PeerName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Ring consistency and merge failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring not sorted")]
    NotSorted,

    #[error("token appears twice in ring")]
    TokenRepeated,

    #[error("token is out of range")]
    TokenOutOfRange,

    #[error("entry {token}-{next} reporting too much free space: {free} > {distance}")]
    TooMuchFree {
        token: Address,
        next: Address,
        free: Count,
        distance: Count,
    },

    #[error("received ring was seeded differently from ours")]
    DifferentSeeds,

    #[error("received range differs from ours")]
    DifferentRange,

    #[error("inconsistent entries for {token}: owned by {mine} but incoming message says {theirs}")]
    InconsistentEntry {
        token: Address,
        mine: PeerName,
        theirs: PeerName,
    },

    #[error("peer {peer} says it owns the range from {token}, which I think I own")]
    EntryInMyRange { peer: PeerName, token: Address },

    #[error("received update for range I own at {token} v{mine}: incoming message says owner {peer} v{theirs}")]
    NewerVersion {
        token: Address,
        mine: u32,
        peer: PeerName,
        theirs: u32,
    },
}

/// One token of the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub token: Address,
    pub peer: PeerName,
    /// Free addresses between this token and the next, as last reported.
    #[serde(with = "u128_string")]
    pub free: Count,
    pub version: u32,
}

impl Entry {
    fn new(token: Address, peer: PeerName, free: Count) -> Self {
        Self {
            token,
            peer,
            free,
            version: 1,
        }
    }

    fn update(&mut self, peer: PeerName, free: Count) {
        self.peer = peer;
        self.free = free;
        self.version += 1;
    }
}

/// Ownership of one contiguous range, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeInfo {
    pub peer: PeerName,
    pub range: Range,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ring {
    pub start: Address,
    pub end: Address,
    #[serde(skip)]
    peer: PeerName,
    entries: Vec<Entry>,
    #[serde(default)]
    seeds: Vec<PeerName>,
}

impl Ring {
    /// Creates an empty ring over `[start, end)` owned by `peer`.
    #[must_use]
    pub fn new(start: Address, end: Address, peer: PeerName) -> Self {
        debug_assert!(start < end);
        Self {
            start,
            end,
            peer,
            entries: Vec::new(),
            seeds: Vec::new(),
        }
    }

    /// Replaces the ring contents with `other`, keeping our own name.
    pub fn restore(&mut self, other: Ring) {
        let peer = std::mem::take(&mut self.peer);
        *self = other;
        self.peer = peer;
    }

    #[must_use]
    pub fn peer(&self) -> &PeerName {
        &self.peer
    }

    #[must_use]
    pub fn range(&self) -> Range {
        Range::new(self.start, self.end)
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    #[must_use]
    pub fn seeds(&self) -> &[PeerName] {
        &self.seeds
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    fn distance(&self, start: Address, end: Address) -> Count {
        if end > start {
            end - start
        } else {
            (self.end - start) + (end - self.start)
        }
    }

    /// Entry at `i`, wrapping in both directions.
    fn entry_at(entries: &[Entry], i: isize) -> &Entry {
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss, reason = "ring sizes are small")]
        let idx = i.rem_euclid(entries.len() as isize) as usize;
        &entries[idx]
    }

    /// Verifies ordering, uniqueness, bounds and free counts.
    ///
    /// # Errors
    ///
    /// The first violated rule.
    pub fn check_invariants(&self) -> Result<(), RingError> {
        self.check_entries(&self.entries)
    }

    fn check_entries(&self, entries: &[Entry]) -> Result<(), RingError> {
        for pair in entries.windows(2) {
            if pair[0].token > pair[1].token {
                return Err(RingError::NotSorted);
            }
        }
        for pair in entries.windows(2) {
            if pair[0].token == pair[1].token {
                return Err(RingError::TokenRepeated);
            }
        }
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(());
        };
        if first.token < self.start || last.token >= self.end {
            return Err(RingError::TokenOutOfRange);
        }
        for (i, entry) in entries.iter().enumerate() {
            #[allow(clippy::cast_possible_wrap, reason = "ring sizes are small")]
            let next = Self::entry_at(entries, i as isize + 1);
            let distance = self.distance(entry.token, next.token);
            if entry.free > distance {
                return Err(RingError::TooMuchFree {
                    token: entry.token,
                    next: next.token,
                    free: entry.free,
                    distance,
                });
            }
        }
        Ok(())
    }

    /// Assigns `[start, end)` to `peer`, inserting up to two tokens.
    ///
    /// The range must be non-empty, inside the universe and owned by us.
    pub fn grant_range_to_host(&mut self, start: Address, end: Address, peer: &PeerName) {
        debug_assert!(start < end);
        debug_assert!(self.start <= start && end <= self.end);
        debug_assert!(!self.entries.is_empty());
        if self.entries.is_empty() {
            return;
        }

        #[allow(clippy::cast_possible_wrap, reason = "ring sizes are small")]
        let preceding = self.entries.partition_point(|e| e.token <= start) as isize - 1;
        let next_token = Self::entry_at(&self.entries, preceding + 1).token;
        let start_free = self.distance(start, next_token).min(self.distance(start, end));

        let previous_token = Self::entry_at(&self.entries, preceding).token;
        let mut pos = if previous_token == start {
            #[allow(clippy::cast_sign_loss, reason = "a token at start cannot wrap")]
            let idx = preceding as usize;
            self.entries[idx].update(peer.clone(), start_free);
            idx + 1
        } else {
            #[allow(clippy::cast_sign_loss, reason = "preceding is at least -1")]
            let insert_at = (preceding + 1) as usize;
            self.entries
                .insert(insert_at, Entry::new(start, peer.clone(), start_free));
            let prev_idx = if preceding < 0 {
                self.entries.len() - 1
            } else {
                insert_at - 1
            };
            let prev_free = self.distance(self.entries[prev_idx].token, start);
            let prev = &mut self.entries[prev_idx];
            let free = prev.free.min(prev_free);
            prev.update(self.peer.clone(), free);
            insert_at + 1
        };

        while pos < self.entries.len() && self.entries[pos].token < end {
            let token = self.entries[pos].token;
            let free = self.entries[pos].free.min(self.distance(token, end));
            self.entries[pos].update(peer.clone(), free);
            pos += 1;
        }

        // the end of the universe is exclusive, so a token there wraps
        let end = if end == self.end { self.start } else { end };
        if self.entries.iter().any(|e| e.token == end) {
            return;
        }
        #[allow(clippy::cast_possible_wrap, reason = "ring sizes are small")]
        let following = Self::entry_at(&self.entries, pos as isize).token;
        let end_free = self.distance(end, following);
        let at = self.entries.partition_point(|e| e.token < end);
        self.entries
            .insert(at, Entry::new(end, self.peer.clone(), end_free));
    }

    /// Merges a gossiped ring into ours and reports whether ours changed.
    ///
    /// # Errors
    ///
    /// An invalid incoming ring, a seed or universe mismatch, or an entry
    /// conflict. Our ring is left untouched on error.
    pub fn merge(&mut self, gossip: &Ring) -> Result<bool, RingError> {
        gossip.check_invariants()?;

        if !gossip.seeds.is_empty() && !self.seeds.is_empty() && gossip.seeds != self.seeds {
            return Err(RingError::DifferentSeeds);
        }
        if self.start != gossip.start || self.end != gossip.end {
            return Err(RingError::DifferentRange);
        }

        let (result, updated) = merge_entries(&self.entries, &gossip.entries, &self.peer)?;
        self.check_entries(&result)?;

        if self.seeds.is_empty() {
            self.seeds.clone_from(&gossip.seeds);
        }
        self.entries = result;
        Ok(updated)
    }

    /// Splits ranges that wrap past the end of the universe.
    fn split_ranges_over_zero(&self, mut ranges: Vec<Range>) -> Vec<Range> {
        let Some(last) = ranges.last().copied() else {
            return ranges;
        };
        if last.end == self.start {
            if let Some(r) = ranges.last_mut() {
                r.end = self.end;
            }
        } else if last.end <= last.start {
            if let Some(r) = ranges.last_mut() {
                r.end = self.end;
            }
            ranges.insert(0, Range::new(self.start, last.end));
        }
        ranges.retain(|r| !r.is_empty());
        ranges
    }

    /// Our ranges, ordered by address.
    #[must_use]
    pub fn owned_ranges(&self) -> Vec<Range> {
        self.owned_ranges_of(&self.peer)
    }

    #[must_use]
    pub fn owned_ranges_of(&self, peer: &PeerName) -> Vec<Range> {
        let ranges = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| &e.peer == peer)
            .map(|(i, e)| {
                #[allow(clippy::cast_possible_wrap, reason = "ring sizes are small")]
                let next = Self::entry_at(&self.entries, i as isize + 1);
                Range::new(e.token, next.token)
            })
            .collect();
        self.split_ranges_over_zero(ranges)
    }

    #[must_use]
    pub fn all_range_info(&self) -> Vec<RangeInfo> {
        let mut out = Vec::new();
        for (i, e) in self.entries.iter().enumerate() {
            #[allow(clippy::cast_possible_wrap, reason = "ring sizes are small")]
            let next = Self::entry_at(&self.entries, i as isize + 1);
            for range in self.split_ranges_over_zero(vec![Range::new(e.token, next.token)]) {
                out.push(RangeInfo {
                    peer: e.peer.clone(),
                    range,
                    version: e.version,
                });
            }
        }
        out
    }

    /// Claims the whole universe for `peers`, in CIDR-aligned slices.
    /// Only valid on an empty ring.
    pub fn claim_for_peers(&mut self, peers: &[PeerName]) {
        debug_assert!(self.is_empty());
        if peers.is_empty() {
            return;
        }
        self.subdivide(self.start, self.end, peers);
        self.seeds = peers.to_vec();
    }

    fn subdivide(&mut self, from: Address, to: Address, peers: &[PeerName]) {
        let share = to - from;
        if share == 0 {
            return;
        }
        if share == 1 || peers.len() == 1 {
            self.entries.push(Entry::new(from, peers[0].clone(), share));
            return;
        }
        let mid = from + share / 2;
        let (left, right) = peers.split_at(peers.len() / 2);
        self.subdivide(from, mid, left);
        self.subdivide(mid + share % 2, to, right);
    }

    /// Records free counts for our ranges, keyed by range start.
    /// Returns true if any entry changed.
    pub fn report_free(&mut self, mut free: BTreeMap<Address, Count>) -> bool {
        let (Some(first), Some(last)) = (self.entries.first(), self.entries.last()) else {
            return false;
        };
        // owned ranges split at the origin; fold the wrapped part back
        if first.token != self.start {
            if let Some(wrapped) = free.remove(&self.start) {
                *free.entry(last.token).or_default() += wrapped;
            }
        }

        let mut updated = false;
        for (start, count) in free {
            let i = self.entries.partition_point(|e| e.token < start);
            if i >= self.entries.len() || self.entries[i].token != start || self.entries[i].peer != self.peer {
                continue;
            }
            #[allow(clippy::cast_possible_wrap, reason = "ring sizes are small")]
            let next = Self::entry_at(&self.entries, i as isize + 1).token;
            if count > self.distance(start, next) || self.entries[i].free == count {
                continue;
            }
            self.entries[i].free = count;
            self.entries[i].version += 1;
            updated = true;
        }
        updated
    }

    /// Peers holding free space in `range`, in weighted-random order.
    #[must_use]
    pub fn choose_peers_to_ask_for_space(&self, range: &Range) -> Vec<PeerName> {
        let mut space: HashMap<&PeerName, Count> = HashMap::new();
        for (i, e) in self.entries.iter().enumerate() {
            if i + 1 < self.entries.len() && self.entries[i + 1].token.0.saturating_sub(1) < range.start.0 {
                continue;
            }
            if e.token >= range.end {
                break;
            }
            if e.free == 0 || e.peer == self.peer {
                continue;
            }
            *space.entry(&e.peer).or_default() += e.free;
        }

        #[allow(clippy::cast_precision_loss, reason = "weights only need to be approximate")]
        let mut weighted: Vec<(f64, &PeerName)> = space
            .into_iter()
            .map(|(peer, free)| (free as f64 * rand::random::<f64>(), peer))
            .collect();
        weighted.sort_by(|a, b| b.0.total_cmp(&a.0));
        weighted.into_iter().map(|(_, p)| p.clone()).collect()
    }

    /// First peer in the ring, other than us, accepted by `is_valid`.
    pub fn pick_peer_for_transfer(&self, is_valid: impl Fn(&PeerName) -> bool) -> Option<PeerName> {
        self.entries
            .iter()
            .find(|e| e.peer != self.peer && is_valid(&e.peer))
            .map(|e| e.peer.clone())
    }

    /// Reassigns every entry of `from` to `to`; returns the ranges moved.
    pub fn transfer(&mut self, from: &PeerName, to: &PeerName) -> Vec<Range> {
        let mut moved = Vec::new();
        for i in 0..self.entries.len() {
            if &self.entries[i].peer != from {
                continue;
            }
            #[allow(clippy::cast_possible_wrap, reason = "ring sizes are small")]
            let next = Self::entry_at(&self.entries, i as isize + 1).token;
            let e = &mut self.entries[i];
            e.peer = to.clone();
            e.version += 1;
            moved.push(Range::new(e.token, next));
        }
        self.split_ranges_over_zero(moved)
    }

    /// Owner of the range holding `addr`, if the ring is populated.
    #[must_use]
    pub fn owner(&self, addr: Address) -> Option<&PeerName> {
        if self.entries.is_empty() || !self.contains(addr) {
            return None;
        }
        #[allow(clippy::cast_possible_wrap, reason = "ring sizes are small")]
        let preceding = self.entries.partition_point(|e| e.token <= addr) as isize - 1;
        Some(&Self::entry_at(&self.entries, preceding).peer)
    }

    #[must_use]
    pub fn peer_names(&self) -> BTreeSet<PeerName> {
        self.entries.iter().map(|e| e.peer.clone()).collect()
    }
}

/// Merges `theirs` into `mine`, refusing changes that stomp on ranges owned
/// by `ours`.
fn merge_entries(mine: &[Entry], theirs: &[Entry], ours: &PeerName) -> Result<(Vec<Entry>, bool), RingError> {
    let mut result = Vec::with_capacity(mine.len().max(theirs.len()));
    let mut updated = false;
    let mut previous_owner: Option<&PeerName> = None;
    let (mut i, mut j) = (0, 0);

    while i < mine.len() && j < theirs.len() {
        let (m, t) = (&mine[i], &theirs[j]);
        if m.token < t.token {
            result.push(m.clone());
            previous_owner = Some(&m.peer);
            i += 1;
        } else if m.token > t.token {
            if splits_my_range(previous_owner, t, ours) {
                return Err(RingError::EntryInMyRange {
                    peer: t.peer.clone(),
                    token: t.token,
                });
            }
            result.push(t.clone());
            updated = true;
            previous_owner = None;
            j += 1;
        } else {
            if m.version >= t.version {
                if m.version == t.version && m.peer != t.peer {
                    return Err(RingError::InconsistentEntry {
                        token: m.token,
                        mine: m.peer.clone(),
                        theirs: t.peer.clone(),
                    });
                }
                result.push(m.clone());
                previous_owner = Some(&m.peer);
            } else {
                if &m.peer == ours {
                    return Err(RingError::NewerVersion {
                        token: m.token,
                        mine: m.version,
                        peer: t.peer.clone(),
                        theirs: t.version,
                    });
                }
                result.push(t.clone());
                updated = true;
                previous_owner = None;
            }
            i += 1;
            j += 1;
        }
    }

    result.extend(mine[i..].iter().cloned());
    for t in &theirs[j..] {
        if splits_my_range(previous_owner, t, ours) {
            return Err(RingError::EntryInMyRange {
                peer: t.peer.clone(),
                token: t.token,
            });
        }
        result.push(t.clone());
        updated = true;
        previous_owner = None;
    }
    Ok((result, updated))
}

fn splits_my_range(previous: Option<&PeerName>, incoming: &Entry, ours: &PeerName) -> bool {
    previous == Some(ours) && &incoming.peer != ours
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u128 = 0x0a00_0000;

    fn dot(n: u128) -> Address {
        Address(BASE + n)
    }

    fn peer(n: u8) -> PeerName {
        PeerName::new(format!("peer{n}"))
    }

    fn ring(n: u8) -> Ring {
        Ring::new(dot(0), dot(256), peer(n))
    }

    fn entry(token: Address, owner: u8, free: Count, version: u32) -> Entry {
        Entry {
            token,
            peer: peer(owner),
            free,
            version,
        }
    }

    fn claim_it_all(r: &mut Ring) {
        let me = r.peer().clone();
        r.claim_for_peers(&[me]);
    }

    #[test]
    fn test_invariants() {
        let mut r = ring(1);
        r.entries = vec![entry(dot(245), 1, 0, 1), entry(dot(10), 2, 0, 1)];
        assert_eq!(r.check_invariants(), Err(RingError::NotSorted));

        r.entries = vec![entry(dot(245), 1, 0, 1), entry(dot(245), 2, 0, 1)];
        assert_eq!(r.check_invariants(), Err(RingError::TokenRepeated));

        let mut r = Ring::new(dot(10), dot(245), peer(1));
        r.entries = vec![entry(dot(0), 1, 0, 1)];
        assert_eq!(r.check_invariants(), Err(RingError::TokenOutOfRange));
        r.entries = vec![entry(dot(245), 1, 0, 1)];
        assert_eq!(r.check_invariants(), Err(RingError::TokenOutOfRange));

        let mut r = ring(1);
        r.entries = vec![entry(dot(0), 1, 10, 1), entry(dot(5), 1, 0, 1)];
        assert!(matches!(r.check_invariants(), Err(RingError::TooMuchFree { .. })));
    }

    #[test]
    fn test_grant_simple() {
        let mut r1 = ring(1);
        let mut r2 = ring(2);
        claim_it_all(&mut r1);
        assert_eq!(r1.entries, vec![entry(dot(0), 1, 256, 1)]);

        r1.grant_range_to_host(dot(0), dot(256), &peer(2));
        assert_eq!(r1.entries, vec![entry(dot(0), 2, 256, 2)]);

        r2.merge(&r1).expect("merge");
        r2.grant_range_to_host(dot(10), dot(256), &peer(1));
        assert_eq!(
            r2.entries,
            vec![entry(dot(0), 2, 10, 3), entry(dot(10), 1, 246, 1)]
        );

        r1.merge(&r2).expect("merge");
        r1.grant_range_to_host(dot(245), dot(256), &peer(2));
        assert_eq!(
            r1.entries,
            vec![
                entry(dot(0), 2, 10, 3),
                entry(dot(10), 1, 235, 2),
                entry(dot(245), 2, 11, 1),
            ]
        );
        r1.check_invariants().expect("valid ring");
    }

    #[test]
    fn test_grant_spanning_live_token() {
        let mut r1 = ring(1);
        r1.entries = vec![
            entry(dot(0), 1, 10, 2),
            entry(dot(10), 1, 118, 1),
            entry(dot(128), 1, 127, 1),
        ];
        r1.grant_range_to_host(dot(10), dot(245), &peer(2));
        assert_eq!(
            r1.entries,
            vec![
                entry(dot(0), 1, 10, 2),
                entry(dot(10), 2, 118, 2),
                entry(dot(128), 2, 117, 2),
                entry(dot(245), 1, 11, 1),
            ]
        );
        r1.check_invariants().expect("valid ring");
    }

    #[test]
    fn test_merge_converges() {
        let mut r1 = ring(1);
        let mut r2 = ring(2);
        claim_it_all(&mut r1);
        r1.grant_range_to_host(dot(128), dot(256), &peer(2));
        assert!(r2.merge(&r1).expect("merge"));
        assert_eq!(r2.entries, r1.entries);

        r1.grant_range_to_host(dot(0), dot(128), &peer(2));
        r2.grant_range_to_host(dot(128), dot(256), &peer(1));
        r2.merge(&r1).expect("merge");
        r1.merge(&r2).expect("merge");
        assert_eq!(r1.entries, r2.entries);
        assert_eq!(r1.owned_ranges(), vec![Range::new(dot(128), dot(256))]);
        assert_eq!(r2.owned_ranges(), vec![Range::new(dot(0), dot(128))]);

        // merging the same state again is a no-op
        assert!(!r1.merge(&r2).expect("merge"));
    }

    #[test]
    fn test_merge_errors() {
        let mut r1 = ring(1);
        let mut r2 = ring(2);
        r2.entries = vec![entry(dot(128), 2, 0, 1), entry(dot(0), 2, 0, 1)];
        assert_eq!(r1.merge(&r2), Err(RingError::NotSorted));

        let r3 = Ring::new(dot(0), dot(128), peer(2));
        assert_eq!(r1.merge(&r3), Err(RingError::DifferentRange));

        r1.entries = vec![entry(dot(0), 1, 0, 1)];
        r2.entries = vec![entry(dot(0), 1, 0, 2)];
        assert!(matches!(r1.merge(&r2), Err(RingError::NewerVersion { .. })));

        r2.entries = vec![entry(dot(0), 2, 0, 1)];
        assert!(matches!(r1.merge(&r2), Err(RingError::InconsistentEntry { .. })));

        r2.entries = vec![entry(dot(128), 2, 0, 1)];
        assert!(matches!(r1.merge(&r2), Err(RingError::EntryInMyRange { .. })));

        // failed merges leave our ring alone
        assert_eq!(r1.entries, vec![entry(dot(0), 1, 0, 1)]);
    }

    #[test]
    fn test_merge_different_seeds() {
        let mut r1 = ring(1);
        let mut r2 = ring(2);
        r1.claim_for_peers(&[peer(1), peer(2)]);
        r2.claim_for_peers(&[peer(2), peer(3)]);
        assert_eq!(r1.merge(&r2), Err(RingError::DifferentSeeds));
    }

    #[test]
    fn test_merge_empty_gossip() {
        let mut r1 = ring(1);
        let r2 = ring(2);
        claim_it_all(&mut r1);
        assert!(!r1.merge(&r2).expect("merge"));
    }

    #[test]
    fn test_owned_ranges_wrap() {
        let mut r = ring(2);
        r.entries = vec![entry(dot(128), 2, 0, 1)];
        assert_eq!(
            r.owned_ranges(),
            vec![Range::new(dot(0), dot(128)), Range::new(dot(128), dot(256))]
        );

        r.entries = vec![entry(dot(10), 2, 0, 1), entry(dot(128), 2, 0, 1)];
        assert_eq!(
            r.owned_ranges(),
            vec![
                Range::new(dot(0), dot(10)),
                Range::new(dot(10), dot(128)),
                Range::new(dot(128), dot(256)),
            ]
        );
    }

    #[test]
    fn test_transfer_and_owner() {
        let mut r = ring(1);
        assert_eq!(r.owner(dot(0)), None);
        claim_it_all(&mut r);
        r.grant_range_to_host(dot(128), dot(256), &peer(2));
        assert_eq!(r.owner(dot(0)), Some(&peer(1)));
        assert_eq!(r.owner(dot(128)), Some(&peer(2)));
        assert_eq!(r.owner(dot(256)), None);

        let moved = r.transfer(&peer(2), &peer(1));
        assert_eq!(moved, vec![Range::new(dot(128), dot(256))]);
        assert_eq!(
            r.owned_ranges(),
            vec![Range::new(dot(0), dot(128)), Range::new(dot(128), dot(256))]
        );

        r.grant_range_to_host(dot(10), dot(128), &peer(2));
        assert_eq!(
            r.owned_ranges(),
            vec![Range::new(dot(0), dot(10)), Range::new(dot(128), dot(256))]
        );
        assert!(r.transfer(&peer(3), &peer(1)).is_empty());
    }

    #[test]
    fn test_claim_for_peers_covers_universe() {
        let peers: Vec<PeerName> = (0..12).map(peer).collect();
        for n in 1..=peers.len() {
            let mut r = Ring::new(dot(0), dot(8), peers[0].clone());
            r.claim_for_peers(&peers[..n]);
            r.check_invariants().expect("valid ring");
            let total: Count = r.entries.iter().map(|e| e.free).sum();
            assert_eq!(total, 8);
            assert_eq!(r.seeds(), &peers[..n]);
        }
    }

    #[test]
    fn test_report_free() {
        let mut r1 = ring(1);
        let mut r2 = ring(2);
        claim_it_all(&mut r1);
        r1.grant_range_to_host(dot(128), dot(256), &peer(2));
        r2.merge(&r1).expect("merge");

        let free = r2.owned_ranges().iter().map(|r| (r.start, 100)).collect();
        assert!(r2.report_free(free));
        assert_eq!(r2.entries[1].free, 100);
        assert_eq!(r2.entries[1].version, 2);

        let same = r2.owned_ranges().iter().map(|r| (r.start, 100)).collect();
        assert!(!r2.report_free(same));
    }

    #[test]
    fn test_report_free_folds_wrapped_range() {
        let mut r = ring(2);
        r.entries = vec![entry(dot(10), 1, 0, 1), entry(dot(128), 2, 0, 1)];
        let free = r.owned_ranges().iter().map(|x| (x.start, x.size())).collect();
        assert!(r.report_free(free));
        assert_eq!(r.entries[1].free, 138);
    }

    #[test]
    fn test_choose_peers_to_ask_for_space() {
        let mut r = ring(1);
        let all = Range::new(dot(0), dot(256));
        assert!(r.choose_peers_to_ask_for_space(&all).is_empty());

        r.entries = vec![entry(dot(0), 1, 10, 1)];
        assert!(r.choose_peers_to_ask_for_space(&all).is_empty());

        r.entries = vec![entry(dot(0), 2, 1, 1), entry(dot(128), 3, 1, 1)];
        assert_eq!(
            r.choose_peers_to_ask_for_space(&Range::new(dot(0), dot(128))),
            vec![peer(2)]
        );
        assert_eq!(
            r.choose_peers_to_ask_for_space(&Range::new(dot(128), dot(256))),
            vec![peer(3)]
        );
        assert_eq!(r.choose_peers_to_ask_for_space(&all).len(), 2);
    }

    #[test]
    fn test_pick_peer_for_transfer_skips_self() {
        let mut r = ring(1);
        r.claim_for_peers(&[peer(1), peer(2), peer(3)]);
        assert_eq!(r.pick_peer_for_transfer(|_| true), Some(peer(2)));
        assert_eq!(r.pick_peer_for_transfer(|p| p == &peer(3)), Some(peer(3)));
        assert_eq!(r.pick_peer_for_transfer(|_| false), None);
    }

    #[test]
    fn test_serde_skips_local_peer() {
        let mut r = ring(1);
        claim_it_all(&mut r);
        let json = serde_json::to_string(&r).expect("encode");
        let decoded: Ring = serde_json::from_str(&json).expect("decode");
        assert!(decoded.peer().is_empty());
        assert_eq!(decoded.entries(), r.entries());

        let mut restored = ring(3);
        restored.restore(decoded);
        assert_eq!(restored.peer(), &peer(3));
    }
}
