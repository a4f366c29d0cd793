use crate::transaction::TransactionId;
use parking_lot::RwLock;
use std::sync::Arc;

/// Bytes per page, shared by every page-format participant.
pub const PAGE_SIZE: usize = 4096;

/// Identifies a page: which table it belongs to and its position in that
/// table's file. Used as the cache and lock-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub table_id: u32,
    pub page_no: u32,
}

impl PageId {
    pub fn new(table_id: u32, page_no: u32) -> Self {
        Self { table_id, page_no }
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.table_id, self.page_no)
    }
}

/// A fixed-size page of table data.
///
/// Besides its byte buffer a page tracks which transaction last dirtied it
/// (`None` when clean) and a before-image: a snapshot of its bytes taken
/// when it was loaded or last committed. The before-image feeds UPDATE log
/// records and is never re-derived between those two points.
pub struct Page {
    id: PageId,
    data: Box<[u8; PAGE_SIZE]>,
    before_image: Box<[u8; PAGE_SIZE]>,
    dirtier: Option<TransactionId>,
}

impl Page {
    /// Creates a page from freshly loaded bytes, capturing the before-image.
    pub fn new(id: PageId, data: Box<[u8; PAGE_SIZE]>) -> Self {
        let before_image = data.clone();
        Self {
            id,
            data,
            before_image,
            dirtier: None,
        }
    }

    /// Creates a zeroed page.
    pub fn empty(id: PageId) -> Self {
        Self::new(id, Box::new([0u8; PAGE_SIZE]))
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    pub fn before_image(&self) -> &[u8; PAGE_SIZE] {
        &self.before_image
    }

    /// Re-snapshots the before-image from the current contents. Called only
    /// at commit; loading captures the initial snapshot.
    pub fn set_before_image(&mut self) {
        self.before_image.copy_from_slice(&self.data[..]);
    }

    /// Rewinds the page's bytes to the before-image, undoing an unlogged
    /// mutation in place.
    pub fn restore_before_image(&mut self) {
        self.data.copy_from_slice(&self.before_image[..]);
    }

    pub fn mark_dirty(&mut self, tid: TransactionId) {
        self.dirtier = Some(tid);
    }

    pub fn mark_clean(&mut self) {
        self.dirtier = None;
    }

    /// The transaction that last dirtied this page, if it is dirty.
    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirtier
    }
}

/// Cached pages are shared between the cache and its callers. Page-level
/// locking orders conflicting logical access; the RwLock guards the bytes.
pub type PageRef = Arc<RwLock<Page>>;
