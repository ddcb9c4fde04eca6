//! Local view of owned and free addresses.

use crate::address::{Address, Count, Range};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SpaceError {
    #[error("address {0:?} is not in a range we own")]
    NotOwned(Address),

    #[error("address {0:?} is already allocated")]
    AlreadyAllocated(Address),

    #[error("address {0:?} is not allocated")]
    NotAllocated(Address),
}

/// Sorted, disjoint, non-adjacent ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet(Vec<Range>);

impl RangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from arbitrary ranges.
    #[must_use]
    pub fn from_ranges(ranges: &[Range]) -> Self {
        let mut set = Self::new();
        for r in ranges {
            set.insert(*r);
        }
        set
    }

    #[must_use]
    pub fn ranges(&self) -> &[Range] {
        &self.0
    }

    pub fn insert(&mut self, r: Range) {
        if r.is_empty() {
            return;
        }
        let mut merged = r;
        let mut out = Vec::with_capacity(self.0.len() + 1);
        let mut placed = false;
        for existing in self.0.drain(..) {
            if existing.end < merged.start {
                out.push(existing);
            } else if merged.end < existing.start {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(existing);
            } else {
                merged = Range::new(merged.start.min(existing.start), merged.end.max(existing.end));
            }
        }
        if !placed {
            out.push(merged);
        }
        self.0 = out;
    }

    pub fn remove(&mut self, r: Range) {
        if r.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.0.len() + 1);
        for existing in self.0.drain(..) {
            if !existing.overlaps(&r) {
                out.push(existing);
                continue;
            }
            if existing.start < r.start {
                out.push(Range::new(existing.start, r.start));
            }
            if r.end < existing.end {
                out.push(Range::new(r.end, existing.end));
            }
        }
        self.0 = out;
    }

    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        self.0.iter().any(|r| r.contains(addr))
    }

    #[must_use]
    pub fn size(&self) -> Count {
        self.0.iter().map(Range::size).sum()
    }

    #[must_use]
    pub fn size_in(&self, r: &Range) -> Count {
        self.0
            .iter()
            .filter_map(|x| x.intersect(r))
            .map(|x| x.size())
            .sum()
    }

    /// Parts of `self` not covered by `other`.
    #[must_use]
    pub fn difference(&self, other: &RangeSet) -> RangeSet {
        let mut out = self.clone();
        for r in &other.0 {
            out.remove(*r);
        }
        out
    }

    /// Lowest address of the set inside `r`.
    fn first_in(&self, r: &Range) -> Option<Address> {
        self.0.iter().find_map(|x| x.intersect(r)).map(|x| x.start)
    }
}

/// Owned ranges and the free subset of them.
#[derive(Debug, Clone, Default)]
pub struct Space {
    owned: RangeSet,
    free: RangeSet,
}

impl Space {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `[start, start+size)`, all of it free.
    pub fn add(&mut self, start: Address, size: Count) {
        let r = Range::new(start, start + size);
        self.owned.insert(r);
        self.free.insert(r);
    }

    /// Replaces the owned set. Newly owned space is free; space no longer
    /// owned is forgotten.
    pub fn update_ranges(&mut self, ranges: &[Range]) {
        let new = RangeSet::from_ranges(ranges);
        for gone in self.owned.difference(&new).ranges() {
            self.free.remove(*gone);
        }
        for added in new.difference(&self.owned).ranges() {
            self.free.insert(*added);
        }
        self.owned = new;
    }

    /// Reserves the lowest free address in `r`.
    pub fn allocate(&mut self, r: &Range) -> Option<Address> {
        let addr = self.free.first_in(r)?;
        self.free.remove(Range::new(addr, addr + 1));
        Some(addr)
    }

    /// Reserves a specific address.
    ///
    /// # Errors
    ///
    /// `NotOwned` or `AlreadyAllocated`.
    pub fn claim(&mut self, addr: Address) -> Result<(), SpaceError> {
        if !self.owned.contains(addr) {
            return Err(SpaceError::NotOwned(addr));
        }
        if !self.free.contains(addr) {
            return Err(SpaceError::AlreadyAllocated(addr));
        }
        self.free.remove(Range::new(addr, addr + 1));
        Ok(())
    }

    /// Returns an address to the free pool.
    ///
    /// # Errors
    ///
    /// `NotOwned` or `NotAllocated` (double free).
    pub fn free(&mut self, addr: Address) -> Result<(), SpaceError> {
        if !self.owned.contains(addr) {
            return Err(SpaceError::NotOwned(addr));
        }
        if self.free.contains(addr) {
            return Err(SpaceError::NotAllocated(addr));
        }
        self.free.insert(Range::new(addr, addr + 1));
        Ok(())
    }

    #[must_use]
    pub fn is_free(&self, addr: Address) -> bool {
        self.free.contains(addr)
    }

    #[must_use]
    pub fn owns(&self, addr: Address) -> bool {
        self.owned.contains(addr)
    }

    #[must_use]
    pub fn num_free(&self) -> Count {
        self.free.size()
    }

    #[must_use]
    pub fn num_free_in_range(&self, r: &Range) -> Count {
        self.free.size_in(r)
    }

    #[must_use]
    pub fn num_owned(&self) -> Count {
        self.owned.size()
    }

    #[must_use]
    pub fn num_allocated(&self) -> Count {
        self.owned.size() - self.free.size()
    }

    #[must_use]
    pub fn owned_ranges(&self) -> &[Range] {
        self.owned.ranges()
    }

    pub fn clear(&mut self) {
        self.owned = RangeSet::new();
        self.free = RangeSet::new();
    }

    /// Gives away part of the free space inside `r`.
    ///
    /// Picks the biggest free CIDR-aligned block in `r` (the higher one on
    /// ties). A block that is the lower half of its parent keeps its lower
    /// half and donates the upper; otherwise the whole block goes.
    pub fn donate(&mut self, r: &Range) -> Option<Range> {
        let block = self.biggest_free_block(r)?;
        let size = block.size();
        let chunk = if size > 1 && block.start.0 % (2 * size) == 0 {
            Range::new(block.start + size / 2, block.end)
        } else {
            block
        };
        self.free.remove(chunk);
        self.owned.remove(chunk);
        Some(chunk)
    }

    fn biggest_free_block(&self, r: &Range) -> Option<Range> {
        let mut best: Option<Range> = None;
        for part in self.free.ranges().iter().filter_map(|f| f.intersect(r)) {
            for block in aligned_blocks(part) {
                let better = best.is_none_or(|b| {
                    block.size() > b.size() || (block.size() == b.size() && block.start > b.start)
                });
                if better {
                    best = Some(block);
                }
            }
        }
        best
    }
}

/// Splits `r` into maximal CIDR-aligned blocks.
fn aligned_blocks(r: Range) -> Vec<Range> {
    let mut blocks = Vec::new();
    let mut start = r.start;
    while start < r.end {
        let remaining = r.end - start;
        let mut size: Count = if start.0 == 0 {
            1 << 127
        } else {
            1 << start.0.trailing_zeros()
        };
        while size > remaining {
            size >>= 1;
        }
        blocks.push(Range::new(start, start + size));
        start = start + size;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u128, end: u128) -> Range {
        Range::new(Address(start), Address(end))
    }

    #[test]
    fn test_allocate_claim_free() {
        let mut space = Space::new();
        space.add(Address(100), 100);
        assert_eq!(space.num_free(), 100);

        assert_eq!(space.allocate(&range(100, 200)), Some(Address(100)));
        assert_eq!(space.allocate(&range(100, 200)), Some(Address(101)));
        assert_eq!(space.claim(Address(150)), Ok(()));
        assert_eq!(space.claim(Address(150)), Err(SpaceError::AlreadyAllocated(Address(150))));
        assert_eq!(space.claim(Address(250)), Err(SpaceError::NotOwned(Address(250))));
        assert_eq!(space.num_free(), 97);

        assert_eq!(space.free(Address(101)), Ok(()));
        assert_eq!(space.free(Address(101)), Err(SpaceError::NotAllocated(Address(101))));
        assert_eq!(space.free(Address(50)), Err(SpaceError::NotOwned(Address(50))));
        assert_eq!(space.num_allocated(), 2);
    }

    #[test]
    fn test_allocate_respects_range() {
        let mut space = Space::new();
        space.add(Address(0), 16);
        assert_eq!(space.allocate(&range(8, 12)), Some(Address(8)));
        assert_eq!(space.allocate(&range(20, 30)), None);
    }

    #[test]
    fn test_donate_prefers_biggest_aligned_block() {
        let mut space = Space::new();
        space.add(Address(100), 100);
        assert_eq!(space.allocate(&range(100, 200)), Some(Address(100)));
        space.claim(Address(150)).expect("claim");
        space.free(Address(100)).expect("free");

        // [160,192) is the upper half of [128,192), so it goes whole
        assert_eq!(space.donate(&range(100, 200)), Some(range(160, 192)));
        assert!(!space.owns(Address(170)));
    }

    #[test]
    fn test_donate_splits_lower_half_blocks() {
        let mut space = Space::new();
        space.add(Address(0), 64);
        assert_eq!(space.donate(&range(0, 64)), Some(range(32, 64)));

        let mut space = Space::new();
        space.add(Address(0), 47);
        assert_eq!(space.donate(&range(0, 47)), Some(range(16, 32)));

        let mut space = Space::new();
        space.add(Address(1), 1);
        assert_eq!(space.donate(&range(0, 4)), Some(range(1, 2)));
        assert_eq!(space.donate(&range(0, 4)), None);
    }

    #[test]
    fn test_biggest_block_ties_go_high() {
        let mut space = Space::new();
        space.add(Address(23), 1);
        space.add(Address(29), 3);
        assert_eq!(space.biggest_free_block(&range(0, 64)), Some(range(30, 32)));

        let mut space = Space::new();
        space.add(Address(0), 8);
        space.add(Address(16), 8);
        assert_eq!(space.biggest_free_block(&range(0, 32)), Some(range(16, 24)));
    }

    #[test]
    fn test_update_ranges() {
        let mut space = Space::new();
        space.update_ranges(&[range(0, 32)]);
        space.claim(Address(5)).expect("claim");
        space.claim(Address(20)).expect("claim");

        space.update_ranges(&[range(0, 16), range(64, 80)]);
        assert_eq!(space.owned_ranges(), &[range(0, 16), range(64, 80)]);
        assert!(!space.is_free(Address(5)));
        assert!(space.is_free(Address(70)));
        assert!(!space.owns(Address(20)));
        assert_eq!(space.num_free(), 31);
    }

    #[test]
    fn test_range_set_merges_adjacent() {
        let mut set = RangeSet::new();
        set.insert(range(10, 20));
        set.insert(range(30, 40));
        set.insert(range(20, 30));
        assert_eq!(set.ranges(), &[range(10, 40)]);
        set.remove(range(15, 35));
        assert_eq!(set.ranges(), &[range(10, 15), range(35, 40)]);
        assert_eq!(set.size_in(&range(0, 12)), 2);
    }
}
