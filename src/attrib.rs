//! Attribute engine.
//!
//! Ties the KV arena, the tuple arena, and the inheritance cache together
//! behind tuple handles. This is where tuples are canonicalized and
//! interned, where the child-over-parent inheritance merge runs, and where
//! delayed reclamation cascades across the arenas: a tuple falling off its
//! delay queue releases the KV entries it held and retires its index in
//! the inheritance cache.

use arrayvec::ArrayVec;
use tracing::trace;

use crate::hash::tuple_hash;
use crate::inherit::InheritCache;
use crate::kv::{EntryId, KvArena, MAX_KEY};
use crate::tuple::{Attrib, TupleArena};

/// The interned-attribute state: every tuple and KV entry lives here.
pub struct AttribState {
    kv: KvArena,
    tuples: TupleArena,
    cache: InheritCache,
    /// Per-key gate consulted by masked inheritance; nonzero lets a
    /// parent-only key through.
    mask: [u8; MAX_KEY],
}

impl AttribState {
    /// Returns a fresh state. `mask` gates parent-only keys during masked
    /// inheritance; `None` leaves every key inheritable.
    pub fn new(mask: Option<&[u8; MAX_KEY]>) -> Self {
        AttribState {
            kv: KvArena::new(),
            tuples: TupleArena::new(),
            cache: InheritCache::new(),
            mask: match mask {
                Some(m) => *m,
                None => [1; MAX_KEY],
            },
        }
    }

    /// Intern `(key, value)` in the KV arena. See [`KvArena::entry_id`].
    pub fn entry_id(&mut self, key: u8, value: &[u8]) -> EntryId {
        self.kv.entry_id(key, value)
    }

    /// Take a reference on a KV entry.
    pub fn entry_addref(&mut self, id: EntryId) {
        self.kv.addref(id);
    }

    /// Drop a reference on a KV entry.
    pub fn entry_release(&mut self, id: EntryId) {
        self.kv.release(id);
    }

    /// Key and value bytes of a KV entry.
    pub fn entry_get(&self, id: EntryId) -> (u8, &[u8]) {
        self.kv.get(id)
    }

    /// Key of a KV entry.
    pub fn entry_key(&self, id: EntryId) -> u8 {
        self.kv.key(id)
    }

    /// Current reference count of a KV entry.
    pub fn entry_refcount(&self, id: EntryId) -> u32 {
        self.kv.refcount(id)
    }

    /// Intern the canonical form of `ids` and return a handle owning one
    /// reference. Inputs may be unsorted and may repeat keys; entries are
    /// sorted ascending by key and a repeated key keeps the last
    /// occurrence. The empty input yields the interned empty tuple.
    pub fn create(&mut self, ids: &[EntryId]) -> Attrib {
        assert!(ids.len() <= MAX_KEY, "tuple too large");
        let mut tmp: ArrayVec<EntryId, MAX_KEY> = ArrayVec::new();
        for &id in ids {
            self.add_sorted(&mut tmp, id);
        }
        let h = tuple_hash(&tmp);
        if let Some(found) = self.tuples.find_matching(h, &tmp) {
            self.tuples.addref(found);
            return Attrib(found);
        }
        for &id in &tmp {
            self.kv.addref(id);
        }
        Attrib(self.tuples.insert(h, tmp.as_slice().into()))
    }

    /// Insertion step of canonicalization: keep `buf` sorted ascending by
    /// key, later duplicates overriding earlier ones.
    fn add_sorted(&self, buf: &mut ArrayVec<EntryId, MAX_KEY>, id: EntryId) {
        let key = self.kv.key(id);
        for i in (0..buf.len()).rev() {
            let bk = self.kv.key(buf[i]);
            if key == bk {
                buf[i] = id;
                return;
            }
            if key > bk {
                buf.insert(i + 1, id);
                return;
            }
        }
        buf.insert(0, id);
    }

    /// Take a reference on a tuple.
    pub fn addref(&mut self, a: Attrib) -> Attrib {
        self.tuples.addref(a.0);
        a
    }

    /// Drop a reference on a tuple. A tuple reaching zero parks on the
    /// delay queue; when one falls off, its KV references are released and
    /// its index is retired from the inheritance cache.
    pub fn release(&mut self, a: Attrib) {
        if let Some(evicted) = self.tuples.release(a.0) {
            self.reclaim_tuple(evicted);
        }
    }

    fn reclaim_tuple(&mut self, idx: u32) {
        let data = self.tuples.take(idx);
        for &id in data.iter() {
            self.kv.release(id);
        }
        self.cache.retire(idx);
        trace!(index = idx, cardinality = data.len(), "tuple reclaimed");
    }

    /// The KV ids of a tuple, in key order.
    pub fn get(&self, a: Attrib) -> &[EntryId] {
        self.tuples.data(a.0)
    }

    /// Number of entries in a tuple.
    pub fn len(&self, a: Attrib) -> usize {
        self.tuples.data(a.0).len()
    }

    /// Position of `key` within a tuple, or `None` if absent.
    pub fn find(&self, a: Attrib, key: u8) -> Option<usize> {
        let data = self.tuples.data(a.0);
        data.binary_search_by(|&id| self.kv.key(id).cmp(&key)).ok()
    }

    /// KV id at position `i` of a tuple, or `None` past the end.
    pub fn index(&self, a: Attrib, i: usize) -> Option<EntryId> {
        self.tuples.data(a.0).get(i).copied()
    }

    /// Current reference count of a tuple.
    pub fn refcount(&self, a: Attrib) -> u32 {
        self.tuples.refcount(a.0)
    }

    /// Merge `parent` under `child` and return a handle owning one
    /// reference on the result. Keys present on both sides resolve to the
    /// child; parent-only keys are inherited, except that with `with_mask`
    /// set they are gated by the per-key mask. When the parent contributes
    /// nothing the child itself is returned (the parent, when the child is
    /// empty and nothing was masked away). Results are memoized per
    /// `(child, parent, with_mask)` until a participating tuple is
    /// retired.
    pub fn inherit(&mut self, child: Attrib, parent: Attrib, with_mask: bool) -> Attrib {
        if let Some(r) = self.cache.fetch(child.0, parent.0, with_mask) {
            self.tuples.addref(r);
            return Attrib(r);
        }
        let result = self.merge(child, parent, with_mask);
        self.cache.set(child.0, parent.0, with_mask, result.0);
        result
    }

    fn merge(&mut self, child: Attrib, parent: Attrib, with_mask: bool) -> Attrib {
        enum Keep {
            Child,
            Parent,
            Fresh,
        }
        let mut out: ArrayVec<EntryId, MAX_KEY> = ArrayVec::new();
        let keep = {
            let child_data = self.tuples.data(child.0);
            let parent_data = self.tuples.data(parent.0);
            let mut contributed = false;
            if child_data.is_empty() {
                if !with_mask {
                    Keep::Parent
                } else {
                    let mut masked = false;
                    for &id in parent_data {
                        if self.mask[self.kv.key(id) as usize] != 0 {
                            out.push(id);
                        } else {
                            masked = true;
                        }
                    }
                    if masked {
                        Keep::Fresh
                    } else {
                        Keep::Parent
                    }
                }
            } else {
                let (mut ci, mut pi) = (0, 0);
                loop {
                    if pi >= parent_data.len() {
                        out.extend(child_data[ci..].iter().copied());
                        break;
                    }
                    if ci >= child_data.len() {
                        for &id in &parent_data[pi..] {
                            if !with_mask || self.mask[self.kv.key(id) as usize] != 0 {
                                out.push(id);
                                contributed = true;
                            }
                        }
                        break;
                    }
                    let cid = child_data[ci];
                    let pid = parent_data[pi];
                    let ck = self.kv.key(cid);
                    let pk = self.kv.key(pid);
                    if ck == pk {
                        // Both sides carry the key: the child's entry wins.
                        out.push(cid);
                        ci += 1;
                        pi += 1;
                    } else if ck < pk {
                        out.push(cid);
                        ci += 1;
                    } else {
                        if !with_mask || self.mask[pk as usize] != 0 {
                            out.push(pid);
                            contributed = true;
                        }
                        pi += 1;
                    }
                }
                if contributed {
                    Keep::Fresh
                } else {
                    Keep::Child
                }
            }
        };
        match keep {
            Keep::Child => self.addref(child),
            Keep::Parent => self.addref(parent),
            Keep::Fresh => self.create(&out),
        }
    }

    /// Bytes retained by the arenas and caches.
    pub fn memsize(&self) -> usize {
        self.kv.memsize() + self.tuples.memsize() + self.cache.memsize()
    }
}
