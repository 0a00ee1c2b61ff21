//! Dirty-dependency list.
//!
//! Records (source → dependent) edges so that modifying a style value can
//! invalidate every composition that might read it. Edges are stamped with
//! the dependent's version at insertion time; clearing a node bumps its
//! version, which retires its outgoing chain immediately and lets every
//! stale incoming edge be garbage-collected lazily on the next walk.

const DIRTY_INIT_SIZE: usize = 1024;
const NIL: i32 = -1;

#[derive(Clone, Copy)]
struct DirtySlot {
    /// Version of `b` when the edge was recorded.
    version: u32,
    b: u32,
    next: i32,
}

#[derive(Clone, Copy)]
struct DirtyHead {
    version: u32,
    head: i32,
}

/// Pool-backed adjacency lists keyed by source node id.
pub struct DirtyList {
    heads: Vec<DirtyHead>,
    slots: Vec<DirtySlot>,
    freelist: i32,
}

impl DirtyList {
    /// Returns an empty list sized for the initial id range.
    pub fn new() -> Self {
        DirtyList {
            heads: vec![
                DirtyHead {
                    version: 0,
                    head: NIL,
                };
                DIRTY_INIT_SIZE
            ],
            slots: Vec::with_capacity(DIRTY_INIT_SIZE),
            freelist: NIL,
        }
    }

    /// Bytes retained by the head array and slot pool.
    pub fn memsize(&self) -> usize {
        self.heads.capacity() * std::mem::size_of::<DirtyHead>()
            + self.slots.capacity() * std::mem::size_of::<DirtySlot>()
    }

    fn reserve_ids(&mut self, id: usize) {
        if id < self.heads.len() {
            return;
        }
        let mut len = self.heads.len();
        while id >= len {
            len += len / 2;
        }
        self.heads.resize(
            len,
            DirtyHead {
                version: 0,
                head: NIL,
            },
        );
    }

    fn alloc_slot(&mut self, slot: DirtySlot) -> i32 {
        if self.freelist >= 0 {
            let index = self.freelist;
            self.freelist = self.slots[index as usize].next;
            self.slots[index as usize] = slot;
            index
        } else {
            self.slots.push(slot);
            (self.slots.len() - 1) as i32
        }
    }

    /// Record that the current alive set of `a`'s dependents includes `b`.
    pub fn add(&mut self, a: usize, b: usize) {
        self.reserve_ids(a.max(b));
        let slot = DirtySlot {
            version: self.heads[b].version,
            b: b as u32,
            next: self.heads[a].head,
        };
        let index = self.alloc_slot(slot);
        self.heads[a].head = index;
    }

    /// Retire every edge into or out of `a`. The outgoing chain is
    /// reclaimed now; incoming edges become stale through the version bump
    /// and are collected by later walks.
    pub fn clear(&mut self, a: usize) {
        if a >= self.heads.len() {
            return;
        }
        let h = &mut self.heads[a];
        h.version = h.version.wrapping_add(1);
        let mut index = h.head;
        if index < 0 {
            return;
        }
        let chain = index;
        h.head = NIL;
        // Splice the whole chain onto the freelist.
        loop {
            let next = self.slots[index as usize].next;
            if next < 0 {
                self.slots[index as usize].next = self.freelist;
                break;
            }
            index = next;
        }
        self.freelist = chain;
    }

    fn alive(&self, slot: &DirtySlot) -> bool {
        self.heads[slot.b as usize].version == slot.version
    }

    /// Collect `id`'s live dependents into `out` (cleared first). Stale
    /// edges found along the way are unlinked and reclaimed.
    pub fn get(&mut self, id: usize, out: &mut Vec<u32>) -> usize {
        out.clear();
        if id >= self.heads.len() {
            return 0;
        }
        let mut index = self.heads[id].head;
        // Walks keep a cursor to the link that points at the current slot
        // so stale slots can be unlinked in place.
        let mut prev = NIL;
        while index >= 0 {
            let slot = self.slots[index as usize];
            if self.alive(&slot) {
                out.push(slot.b);
                prev = index;
                index = slot.next;
            } else {
                if prev < 0 {
                    self.heads[id].head = slot.next;
                } else {
                    self.slots[prev as usize].next = slot.next;
                }
                self.slots[index as usize].next = self.freelist;
                self.freelist = index;
                index = slot.next;
            }
        }
        out.len()
    }
}

impl Default for DirtyList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(list: &mut DirtyList, id: usize) -> Vec<u32> {
        let mut out = Vec::new();
        list.get(id, &mut out);
        out.sort_unstable();
        out
    }

    #[test]
    fn add_and_get() {
        let mut d = DirtyList::new();
        d.add(0, 1);
        d.add(0, 2);
        d.add(0, 3);
        d.add(1, 2);
        d.add(2, 3);
        d.add(2, 0);
        assert_eq!(sorted(&mut d, 0), vec![1, 2, 3]);
        assert_eq!(sorted(&mut d, 1), vec![2]);
        assert_eq!(sorted(&mut d, 2), vec![0, 3]);
        assert_eq!(sorted(&mut d, 3), Vec::<u32>::new());
    }

    #[test]
    fn clear_drops_outgoing_and_incoming() {
        let mut d = DirtyList::new();
        d.add(0, 1);
        d.add(0, 2);
        d.add(1, 2);
        d.clear(2);
        // 2's own list is gone, and edges pointing at 2 are now stale.
        assert_eq!(sorted(&mut d, 2), Vec::<u32>::new());
        assert_eq!(sorted(&mut d, 0), vec![1]);
        assert_eq!(sorted(&mut d, 1), Vec::<u32>::new());
    }

    #[test]
    fn re_add_after_clear_is_alive() {
        let mut d = DirtyList::new();
        d.add(0, 1);
        d.clear(1);
        assert_eq!(sorted(&mut d, 0), Vec::<u32>::new());
        d.add(0, 1);
        assert_eq!(sorted(&mut d, 0), vec![1]);
    }

    #[test]
    fn stale_slots_are_reclaimed() {
        let mut d = DirtyList::new();
        // Stale edges reclaimed by a walk go back to the pool, so heavy
        // add/clear cycling must not grow the pool without bound.
        for _ in 0..10_000 {
            d.add(0, 1);
            d.clear(1);
            let mut out = Vec::new();
            d.get(0, &mut out);
            assert!(out.is_empty());
        }
        assert!(d.slots.len() <= 2);
    }

    #[test]
    fn grows_with_id_range() {
        let mut d = DirtyList::new();
        d.add(5000, 6000);
        assert_eq!(sorted(&mut d, 5000), vec![6000]);
    }
}
