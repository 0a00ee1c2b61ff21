//! Interning index table.
//!
//! An open-addressed index over entries owned by an external arena. The
//! table stores only arena indices; entry hashes are read back through a
//! caller-supplied callback, so nothing is duplicated here. The top bits of
//! a hash select a main slot, which absorbs the common collision-free case
//! in O(1). Slot conflicts spill into a single array kept sorted by hash,
//! so equal-hash runs are found by binary search and walked contiguously.
//!
//! Two instances of this table exist in the crate: one over key/value
//! entries and one over attribute tuples.

use tracing::trace;

use crate::hash::HashKind;

/// Marker for an empty main slot.
pub const INVALID_INDEX: u32 = u32::MAX;

/// Starting size: 2^(6+1) = 128 main slots, 64 collision slots.
const START_BITS: u32 = 6;

/// Index table with a two-tier layout: direct-mapped main slots plus a
/// hash-sorted collision array.
///
/// Invariant: every index in the collision array has an occupied main slot
/// (by some entry, not necessarily one with the same hash). `remove` repairs
/// a vacated main slot from the collision array to preserve this, which
/// keeps every stored index reachable through [`InternTable::candidates`].
pub struct InternTable {
    /// 32 minus the number of main-slot address bits.
    shift: u32,
    /// Total indices stored, across main slots and collisions.
    len: usize,
    /// Main slots; `INVALID_INDEX` when empty.
    index: Vec<u32>,
    /// Evicted slot occupants, sorted ascending by their hash.
    collide: Vec<u32>,
}

impl InternTable {
    /// Returns an empty table at the default starting size.
    pub fn new() -> Self {
        Self::with_bits(START_BITS)
    }

    fn with_bits(bits: u32) -> Self {
        InternTable {
            shift: 32 - bits - 1,
            len: 0,
            index: vec![INVALID_INDEX; 1 << (bits + 1)],
            collide: Vec::with_capacity(1 << bits),
        }
    }

    /// Number of indices stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no indices are stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Entry count that triggers a resize.
    fn threshold(&self) -> usize {
        self.index.len() / 2
    }

    /// Bytes retained by the table itself.
    pub fn memsize(&self) -> usize {
        (self.index.len() + self.collide.capacity()) * std::mem::size_of::<u32>()
    }

    #[inline]
    fn main_slot(&self, h: HashKind) -> usize {
        (h >> self.shift) as usize
    }

    /// Store `index`. The entry's hash is read through `hash`; the caller
    /// guarantees it stays stable while the index is stored.
    pub fn insert<F>(&mut self, index: u32, hash: F)
    where
        F: Fn(u32) -> HashKind,
    {
        self.len += 1;
        if self.len >= self.threshold() {
            self.grow(&hash);
        }
        self.place(index, &hash);
    }

    fn place<F>(&mut self, index: u32, hash: &F)
    where
        F: Fn(u32) -> HashKind,
    {
        let h = hash(index);
        let slot = self.main_slot(h);
        let occupant = self.index[slot];
        if occupant != INVALID_INDEX {
            debug_assert_ne!(occupant, index);
            // The previous occupant moves into the sorted collision array;
            // the newcomer takes the main slot. Insertion at the lower bound
            // keeps equal-hash runs in insertion order.
            let oh = hash(occupant);
            let at = self.collide.partition_point(|&i| hash(i) < oh);
            debug_assert!(self.collide.len() < self.threshold());
            self.collide.insert(at, occupant);
        }
        self.index[slot] = index;
    }

    fn grow<F>(&mut self, hash: &F)
    where
        F: Fn(u32) -> HashKind,
    {
        let bits = 31 - self.shift;
        let old = std::mem::replace(self, Self::with_bits(bits + 1));
        self.len = old.len;
        for i in old.collide {
            self.place(i, hash);
        }
        for i in old.index {
            if i != INVALID_INDEX {
                self.place(i, hash);
            }
        }
        trace!(
            entries = self.len,
            slots = self.index.len(),
            "intern table grown"
        );
    }

    /// Iterate every stored index whose entry hashes to `h`. The table only
    /// narrows candidates by hash; the caller confirms byte-level identity.
    pub fn candidates<F>(&self, h: HashKind, hash: F) -> Candidates<'_, F>
    where
        F: Fn(u32) -> HashKind,
    {
        let occupant = self.index[self.main_slot(h)];
        let (main, run) = if occupant == INVALID_INDEX {
            // An empty main slot implies no collision entry shares it.
            (None, self.collide.len())
        } else {
            let main = (hash(occupant) == h).then(|| occupant);
            let run = self.collide.partition_point(|&i| hash(i) < h);
            (main, run)
        };
        Candidates {
            table: self,
            h,
            hash,
            main,
            run,
        }
    }

    /// Remove a stored index. Panics if it is not present.
    pub fn remove<F>(&mut self, index: u32, hash: F)
    where
        F: Fn(u32) -> HashKind,
    {
        let h = hash(index);
        let slot = self.main_slot(h);
        self.len -= 1;
        if self.index[slot] == index {
            // Repair the slot from the collision array so the remaining
            // entries sharing it stay reachable. Entries with a common main
            // slot are contiguous because the slot is a hash prefix.
            let at = self
                .collide
                .partition_point(|&i| self.main_slot(hash(i)) < slot);
            if at < self.collide.len() && self.main_slot(hash(self.collide[at])) == slot {
                self.index[slot] = self.collide.remove(at);
            } else {
                self.index[slot] = INVALID_INDEX;
            }
        } else {
            let mut at = self.collide.partition_point(|&i| hash(i) < h);
            loop {
                assert!(
                    at < self.collide.len() && hash(self.collide[at]) == h,
                    "index not present in intern table"
                );
                if self.collide[at] == index {
                    break;
                }
                at += 1;
            }
            self.collide.remove(at);
        }
    }
}

impl Default for InternTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the stored indices matching one hash value.
pub struct Candidates<'a, F> {
    table: &'a InternTable,
    h: HashKind,
    hash: F,
    main: Option<u32>,
    run: usize,
}

impl<'a, F> Iterator for Candidates<'a, F>
where
    F: Fn(u32) -> HashKind,
{
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if let Some(i) = self.main.take() {
            return Some(i);
        }
        let &i = self.table.collide.get(self.run)?;
        if (self.hash)(i) == self.h {
            self.run += 1;
            Some(i)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::int32_hash;

    fn collect(table: &InternTable, h: HashKind, hashes: &[u32]) -> Vec<u32> {
        let mut found: Vec<u32> = table
            .candidates(h, |i| hashes[i as usize])
            .collect();
        found.sort_unstable();
        found
    }

    #[test]
    fn insert_and_find_equal_hash_runs() {
        // Four entries per hash value forces main-slot eviction into the
        // collision array.
        let hashes: Vec<u32> = (0u32..32).map(|i| int32_hash(i / 4)).collect();
        let mut table = InternTable::with_bits(4);
        for i in 0..hashes.len() as u32 {
            table.insert(i, |i| hashes[i as usize]);
        }
        assert_eq!(table.len(), hashes.len());

        for group in 0..8u32 {
            let h = int32_hash(group);
            let members = collect(&table, h, &hashes);
            let expect: Vec<u32> = (group * 4..group * 4 + 4).collect();
            assert_eq!(members, expect);
        }
    }

    #[test]
    fn miss_yields_nothing() {
        let hashes: Vec<u32> = (0u32..8).map(int32_hash).collect();
        let mut table = InternTable::new();
        for i in 0..hashes.len() as u32 {
            table.insert(i, |i| hashes[i as usize]);
        }
        assert!(collect(&table, int32_hash(1000), &hashes).is_empty());
    }

    #[test]
    fn growth_preserves_entries() {
        // 300 entries from a 16-slot start crosses several resizes.
        let hashes: Vec<u32> = (0u32..300).map(|i| int32_hash(i / 2)).collect();
        let mut table = InternTable::with_bits(3);
        for i in 0..hashes.len() as u32 {
            table.insert(i, |i| hashes[i as usize]);
        }
        assert_eq!(table.len(), 300);
        for pair in 0..150u32 {
            let members = collect(&table, int32_hash(pair), &hashes);
            assert_eq!(members, vec![pair * 2, pair * 2 + 1]);
        }
    }

    #[test]
    fn remove_from_collision_run() {
        let hashes: Vec<u32> = (0u32..12).map(|i| int32_hash(i / 4)).collect();
        let mut table = InternTable::with_bits(4);
        for i in 0..hashes.len() as u32 {
            table.insert(i, |i| hashes[i as usize]);
        }

        // Index 1 sits inside hash-group 0's collision run.
        table.remove(1, |i| hashes[i as usize]);
        assert_eq!(table.len(), 11);
        assert_eq!(collect(&table, int32_hash(0), &hashes), vec![0, 2, 3]);
        assert_eq!(collect(&table, int32_hash(1), &hashes), vec![4, 5, 6, 7]);
    }

    #[test]
    fn remove_repairs_main_slot() {
        let hashes: Vec<u32> = (0u32..4).map(|_| int32_hash(9)).collect();
        let mut table = InternTable::with_bits(4);
        for i in 0..hashes.len() as u32 {
            table.insert(i, |i| hashes[i as usize]);
        }

        // The last inserted index owns the main slot; removing it must
        // promote one of the collision entries, keeping the rest reachable.
        table.remove(3, |i| hashes[i as usize]);
        assert_eq!(collect(&table, int32_hash(9), &hashes), vec![0, 1, 2]);
        table.remove(0, |i| hashes[i as usize]);
        table.remove(2, |i| hashes[i as usize]);
        assert_eq!(collect(&table, int32_hash(9), &hashes), vec![1]);
        table.remove(1, |i| hashes[i as usize]);
        assert!(table.is_empty());
        assert!(collect(&table, int32_hash(9), &hashes).is_empty());
    }

    #[test]
    fn remove_then_reinsert() {
        let hashes: Vec<u32> = (0u32..64).map(|i| int32_hash(i % 16)).collect();
        let mut table = InternTable::new();
        for i in 0..hashes.len() as u32 {
            table.insert(i, |i| hashes[i as usize]);
        }
        for i in (0..64u32).step_by(2) {
            table.remove(i, |i| hashes[i as usize]);
        }
        for i in (0..64u32).step_by(2) {
            table.insert(i, |i| hashes[i as usize]);
        }
        for group in 0..16u32 {
            let members = collect(&table, int32_hash(group), &hashes);
            let expect: Vec<u32> = (0..64).filter(|i| i % 16 == group).collect();
            assert_eq!(members, expect);
        }
    }
}
