//! Tuple-level access methods layered on the page cache.
//!
//! These are deliberately minimal consumers of the core: fixed-width
//! integer tuples in bitmap-slotted heap pages. All page access goes
//! through the cache so that locking, WAL, and eviction apply.

pub mod heap;
pub mod tuple;

pub use heap::{HeapFile, HeapPage, HeapPageMut};
pub use tuple::{RecordId, Schema, Tuple};
