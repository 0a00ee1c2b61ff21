//! Style-attribute cache core library.
//!
//! An in-memory substrate for styling engines: key/value attributes are
//! interned once, grouped into canonical tuples, and composed by
//! inheritance through a graph of reference-counted style nodes with lazy,
//! self-invalidating evaluation. Designed for frame-oriented workloads
//! where lookups and recompositions vastly outnumber allocations.

pub mod attrib;
pub mod delay;
pub mod dirty;
pub mod hash;
pub mod inherit;
pub mod intern;
pub mod kv;
pub mod style;
pub mod tuple;

pub use attrib::AttribState;
pub use kv::{EntryId, EMBED_VALUE_SIZE, MAX_KEY};
pub use style::{StyleCache, StyleHandle};
pub use tuple::Attrib;
