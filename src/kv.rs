//! Key/value entry arena.
//!
//! Every attribute value lives here exactly once: entries are interned by
//! `(key, bytes)`, so equal requests always return the same index. Values
//! of at most [`EMBED_VALUE_SIZE`] bytes are embedded in the entry; larger
//! values go to a heap blob. Entries are reference counted by the tuples
//! that contain them, and an entry released to zero is parked on a delay
//! queue rather than freed, so release-then-reacquire churn keeps its
//! identity.

use tracing::trace;

use crate::delay::DelayQueue;
use crate::hash::{kv_hash, HashKind};
use crate::intern::InternTable;

/// EntryId is an alias for the stable index of an interned entry.
pub type EntryId = u32;

/// Keys are 7-bit: the valid range is `0..MAX_KEY`.
pub const MAX_KEY: usize = 128;

/// Values up to this many bytes are stored inline in the entry.
pub const EMBED_VALUE_SIZE: usize = 8;

/// Refcounts were 24 bits in the packed layout; the ceiling is kept as a
/// contract even though the field is stored unpacked.
const MAX_REFCOUNT: u32 = 0x00ff_ffff;

enum Payload {
    Inline {
        len: u8,
        data: [u8; EMBED_VALUE_SIZE],
    },
    Blob(Box<[u8]>),
}

impl Payload {
    fn new(value: &[u8]) -> Self {
        if value.len() <= EMBED_VALUE_SIZE {
            let mut data = [0u8; EMBED_VALUE_SIZE];
            data[..value.len()].copy_from_slice(value);
            Payload::Inline {
                len: value.len() as u8,
                data,
            }
        } else {
            Payload::Blob(value.into())
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Payload::Inline { len, data } => &data[..*len as usize],
            Payload::Blob(blob) => blob,
        }
    }
}

struct KvEntry {
    key: u8,
    /// True while the entry sits in the delay queue.
    pending: bool,
    refcount: u32,
    hash: HashKind,
    payload: Payload,
}

/// Arena of interned key/value entries.
pub struct KvArena {
    entries: Vec<KvEntry>,
    intern: InternTable,
    delay: DelayQueue,
    free: Vec<u32>,
}

impl KvArena {
    /// Returns an empty arena.
    pub fn new() -> Self {
        KvArena {
            entries: Vec::new(),
            intern: InternTable::new(),
            delay: DelayQueue::new(),
            free: Vec::new(),
        }
    }

    /// Intern `(key, value)` and return its stable id. Equal key and byte
    /// sequence always map to the same id. The returned entry carries no
    /// reference; containers take one with [`KvArena::addref`].
    pub fn entry_id(&mut self, key: u8, value: &[u8]) -> EntryId {
        assert!((key as usize) < MAX_KEY, "key out of range");
        let h = kv_hash(key, value);
        {
            let entries = &self.entries;
            for idx in self.intern.candidates(h, |i| entries[i as usize].hash) {
                let e = &entries[idx as usize];
                if e.key == key && e.payload.bytes() == value {
                    return idx;
                }
            }
        }
        let entry = KvEntry {
            key,
            pending: false,
            refcount: 0,
            hash: h,
            payload: Payload::new(value),
        };
        let idx = match self.free.pop() {
            Some(slot) => {
                self.entries[slot as usize] = entry;
                slot
            }
            None => {
                self.entries.push(entry);
                (self.entries.len() - 1) as u32
            }
        };
        let entries = &self.entries;
        self.intern.insert(idx, |i| entries[i as usize].hash);
        idx
    }

    /// Take a reference on an entry.
    pub fn addref(&mut self, id: EntryId) {
        let e = &mut self.entries[id as usize];
        assert!(e.refcount < MAX_REFCOUNT, "kv refcount overflow");
        e.refcount += 1;
    }

    /// Drop a reference. An entry reaching zero is parked on the delay
    /// queue; physical reclamation happens when it falls off the far end,
    /// unless it was re-acquired in the meantime.
    pub fn release(&mut self, id: EntryId) {
        let e = &mut self.entries[id as usize];
        assert!(e.refcount > 0, "kv refcount underflow");
        e.refcount -= 1;
        if e.refcount == 0 && !e.pending {
            e.pending = true;
            if let Some(oldest) = self.delay.push(id) {
                self.reclaim(oldest);
            }
        }
    }

    fn reclaim(&mut self, id: u32) {
        let e = &mut self.entries[id as usize];
        e.pending = false;
        if e.refcount != 0 {
            // Resurrected while parked; it will come back around on its
            // next release to zero.
            return;
        }
        let entries = &self.entries;
        self.intern.remove(id, |i| entries[i as usize].hash);
        self.entries[id as usize].payload = Payload::Inline {
            len: 0,
            data: [0; EMBED_VALUE_SIZE],
        };
        self.free.push(id);
        trace!(id, "kv entry reclaimed");
    }

    /// Key of an entry.
    pub fn key(&self, id: EntryId) -> u8 {
        self.entries[id as usize].key
    }

    /// Key and value bytes of an entry.
    pub fn get(&self, id: EntryId) -> (u8, &[u8]) {
        let e = &self.entries[id as usize];
        (e.key, e.payload.bytes())
    }

    /// Current reference count of an entry.
    pub fn refcount(&self, id: EntryId) -> u32 {
        self.entries[id as usize].refcount
    }

    /// Bytes retained by entries, blobs, and the intern table.
    pub fn memsize(&self) -> usize {
        let blobs: usize = self
            .entries
            .iter()
            .map(|e| match &e.payload {
                Payload::Inline { .. } => 0,
                Payload::Blob(b) => b.len(),
            })
            .sum();
        self.entries.capacity() * std::mem::size_of::<KvEntry>()
            + blobs
            + self.intern.memsize()
            + self.free.capacity() * std::mem::size_of::<u32>()
    }
}

impl Default for KvArena {
    fn default() -> Self {
        Self::new()
    }
}
