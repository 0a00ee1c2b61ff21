//! Inheritance result cache.
//!
//! Memoizes `(child, parent, with_mask) → result` over tuple indices in a
//! direct-mapped table. Entries do not pin their tuples; instead every
//! tuple index has a version counter that is bumped when the tuple is
//! retired, and a lookup only hits while all three recorded versions still
//! match. Retiring any participant therefore invalidates dependent
//! entries lazily, with no scan.

use tracing::trace;

use crate::hash::int32_hash;

const INHERIT_CACHE_SIZE: usize = 1 << 13;
const INHERIT_CACHE_SHIFT: u32 = 32 - 13;
const INVALID_KEY: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct InheritEntry {
    a: u32,
    b: u32,
    result: u32,
    with_mask: bool,
    a_version: u16,
    b_version: u16,
    r_version: u16,
}

const EMPTY_ENTRY: InheritEntry = InheritEntry {
    a: INVALID_KEY,
    b: 0,
    result: 0,
    with_mask: false,
    a_version: 0,
    b_version: 0,
    r_version: 0,
};

/// Fixed-size memo table with per-tuple versioned invalidation.
pub struct InheritCache {
    slots: Box<[InheritEntry]>,
    /// Live version per tuple index; grows with the tuple arena.
    versions: Vec<u16>,
}

fn slot_of(a: u32, b: u32) -> usize {
    let v = (a & 0xffff) | ((b & 0xffff) << 16);
    (int32_hash(v) >> INHERIT_CACHE_SHIFT) as usize
}

impl InheritCache {
    /// Returns an empty cache.
    pub fn new() -> Self {
        InheritCache {
            slots: vec![EMPTY_ENTRY; INHERIT_CACHE_SIZE].into_boxed_slice(),
            versions: Vec::new(),
        }
    }

    /// Memoized result for `(a, b, with_mask)`, if still valid under the
    /// live versions of all three tuples involved.
    pub fn fetch(&self, a: u32, b: u32, with_mask: bool) -> Option<u32> {
        let a_live = *self.versions.get(a as usize)?;
        let b_live = *self.versions.get(b as usize)?;
        let e = &self.slots[slot_of(a, b)];
        let r_live = *self.versions.get(e.result as usize)?;
        if e.a == a
            && e.b == b
            && e.with_mask == with_mask
            && e.a_version == a_live
            && e.b_version == b_live
            && e.r_version == r_live
        {
            Some(e.result)
        } else {
            None
        }
    }

    /// Record `(a, b, with_mask) → result`, stamping the live versions.
    pub fn set(&mut self, a: u32, b: u32, with_mask: bool, result: u32) {
        self.reserve(a.max(b).max(result) as usize);
        self.slots[slot_of(a, b)] = InheritEntry {
            a,
            b,
            result,
            with_mask,
            a_version: self.versions[a as usize],
            b_version: self.versions[b as usize],
            r_version: self.versions[result as usize],
        };
    }

    /// Invalidate every entry mentioning tuple index `idx` by bumping its
    /// version. A wrap of the counter forces an eager sweep so a stale
    /// entry can never alias a fresh version.
    pub fn retire(&mut self, idx: u32) {
        let idx = idx as usize;
        if idx >= self.versions.len() {
            return;
        }
        self.versions[idx] = self.versions[idx].wrapping_add(1);
        if self.versions[idx] == 0 {
            let idx = idx as u32;
            for e in self.slots.iter_mut() {
                if e.a == idx || e.b == idx || e.result == idx {
                    e.a = INVALID_KEY;
                }
            }
            trace!(index = idx, "inherit cache version wrapped, swept");
        }
    }

    fn reserve(&mut self, idx: usize) {
        if idx < self.versions.len() {
            return;
        }
        let mut len = self.versions.len().max(INHERIT_CACHE_SIZE);
        while idx >= len {
            len += len / 2;
        }
        self.versions.resize(len, 0);
    }

    /// Bytes retained by the table and the version vector.
    pub fn memsize(&self) -> usize {
        self.slots.len() * std::mem::size_of::<InheritEntry>()
            + self.versions.capacity() * std::mem::size_of::<u16>()
    }
}

impl Default for InheritCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_fetch() {
        let mut c = InheritCache::new();
        assert_eq!(c.fetch(1, 2, false), None);
        c.set(1, 2, false, 3);
        assert_eq!(c.fetch(1, 2, false), Some(3));
        // The mask flag is part of the key.
        assert_eq!(c.fetch(1, 2, true), None);
    }

    #[test]
    fn retire_invalidates_each_participant() {
        for retired in [1u32, 2, 3] {
            let mut c = InheritCache::new();
            c.set(1, 2, false, 3);
            c.retire(retired);
            assert_eq!(c.fetch(1, 2, false), None);
        }
    }

    #[test]
    fn reset_after_retire() {
        let mut c = InheritCache::new();
        c.set(1, 2, true, 3);
        c.retire(3);
        assert_eq!(c.fetch(1, 2, true), None);
        c.set(1, 2, true, 4);
        assert_eq!(c.fetch(1, 2, true), Some(4));
    }

    #[test]
    fn version_wrap_sweeps_entries() {
        let mut c = InheritCache::new();
        c.set(1, 2, false, 3);
        c.set(4, 5, false, 6);
        // Wind index 3's counter to the wrap point.
        c.versions[3] = u16::MAX;
        // The recorded r_version no longer matches, and the wrap must also
        // scrub the slot itself.
        c.retire(3);
        assert_eq!(c.versions[3], 0);
        assert_eq!(c.fetch(1, 2, false), None);
        assert_eq!(c.slots[slot_of(1, 2)].a, INVALID_KEY);
        // Unrelated entries survive the sweep.
        assert_eq!(c.fetch(4, 5, false), Some(6));
    }

    #[test]
    fn unknown_indices_miss() {
        let c = InheritCache::new();
        assert_eq!(c.fetch(100_000, 2, false), None);
    }
}
