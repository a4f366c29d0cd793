//! Storage layer: pages, the on-disk page files, and the page cache.
//!
//! - **Page**: fixed-size (4KB) block of bytes, the basic unit of I/O,
//!   carrying a dirty flag and the before-image used by rollback/recovery
//! - **PagedFile / PageStore**: durable per-table page storage
//! - **PageCache**: bounded in-memory cache mediating all page access,
//!   coordinating with the lock manager and the write-ahead log

pub mod buffer;
pub mod disk;
pub mod page;

pub use buffer::PageCache;
pub use disk::{PageStore, PagedFile};
pub use page::{Page, PageId, PageRef, PAGE_SIZE};
