use crate::access::tuple::{RecordId, Schema, Tuple};
use crate::concurrency::lock::LockMode;
use crate::error::{DbError, DbResult};
use crate::storage::buffer::PageCache;
use crate::storage::disk::{PageStore, PagedFile};
use crate::storage::page::{Page, PageId, PAGE_SIZE};
use crate::transaction::TransactionId;
use parking_lot::Mutex;
use std::path::Path;

/// A read-only bitmap-slotted view over one page's bytes.
///
/// Layout: a header bitmap of one bit per slot (bit set means occupied),
/// followed by fixed-width tuples. The slot count is chosen so that header
/// and tuples together fit the page:
/// `slot_count = floor(PAGE_SIZE * 8 / (tuple_bytes * 8 + 1))`.
///
/// Borrowing the bytes immutably lets scans run under a page read guard;
/// [`HeapPageMut`] is the writing counterpart.
pub struct HeapPage<'a> {
    data: &'a [u8; PAGE_SIZE],
    schema: Schema,
}

impl<'a> HeapPage<'a> {
    pub fn new(data: &'a [u8; PAGE_SIZE], schema: Schema) -> Self {
        Self { data, schema }
    }

    pub fn slot_count(&self) -> usize {
        (PAGE_SIZE * 8) / (self.schema.tuple_bytes() * 8 + 1)
    }

    fn header_bytes(&self) -> usize {
        (self.slot_count() + 7) / 8
    }

    pub fn is_used(&self, slot: usize) -> bool {
        self.data[slot / 8] & (1 << (slot % 8)) != 0
    }

    fn slot_offset(&self, slot: usize) -> usize {
        self.header_bytes() + slot * self.schema.tuple_bytes()
    }

    pub fn values_at(&self, slot: usize) -> DbResult<Vec<i32>> {
        if slot >= self.slot_count() || !self.is_used(slot) {
            return Err(DbError::TupleNotFound { slot });
        }
        let mut offset = self.slot_offset(slot);
        let mut values = Vec::with_capacity(self.schema.fields());
        for _ in 0..self.schema.fields() {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&self.data[offset..offset + 4]);
            values.push(i32::from_be_bytes(raw));
            offset += 4;
        }
        Ok(values)
    }

    pub fn free_slots(&self) -> usize {
        (0..self.slot_count()).filter(|&s| !self.is_used(s)).count()
    }
}

/// A mutable view over one page's bytes, sharing [`HeapPage`]'s layout.
pub struct HeapPageMut<'a> {
    data: &'a mut [u8; PAGE_SIZE],
    schema: Schema,
}

impl<'a> HeapPageMut<'a> {
    pub fn new(data: &'a mut [u8; PAGE_SIZE], schema: Schema) -> Self {
        Self { data, schema }
    }

    fn view(&self) -> HeapPage<'_> {
        HeapPage {
            data: &*self.data,
            schema: self.schema,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.view().slot_count()
    }

    fn set_used(&mut self, slot: usize, used: bool) {
        if used {
            self.data[slot / 8] |= 1 << (slot % 8);
        } else {
            self.data[slot / 8] &= !(1 << (slot % 8));
        }
    }

    /// Stores `values` in the first free slot and returns its number, or
    /// `None` when the page is full.
    pub fn insert(&mut self, values: &[i32]) -> DbResult<Option<usize>> {
        if values.len() != self.schema.fields() {
            return Err(DbError::SchemaMismatch {
                expected: self.schema.fields(),
                actual: values.len(),
            });
        }
        let view = self.view();
        let slot = match (0..view.slot_count()).find(|&s| !view.is_used(s)) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let mut offset = view.slot_offset(slot);
        for &value in values {
            self.data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
            offset += 4;
        }
        self.set_used(slot, true);
        Ok(Some(slot))
    }

    pub fn delete(&mut self, slot: usize) -> DbResult<()> {
        let view = self.view();
        if slot >= view.slot_count() || !view.is_used(slot) {
            return Err(DbError::TupleNotFound { slot });
        }
        self.set_used(slot, false);
        Ok(())
    }
}

/// One table stored as an unordered sequence of heap pages in a single
/// file. The file never shrinks; deletes just clear slot bits.
pub struct HeapFile {
    table_id: u32,
    schema: Schema,
    file: PagedFile,
    /// Serializes file growth so two inserters cannot both append (and
    /// zero) the same new page.
    grow: Mutex<()>,
}

impl HeapFile {
    /// Opens the table file at `path`, creating it empty if absent.
    pub fn open_or_create(path: &Path, table_id: u32, schema: Schema) -> DbResult<Self> {
        Ok(Self {
            table_id,
            schema,
            file: PagedFile::open_or_create(path)?,
            grow: Mutex::new(()),
        })
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn schema(&self) -> Schema {
        self.schema
    }

    /// Inserts `tuple`, setting its record id. Scans existing pages for a
    /// free slot and appends a fresh page when all are full. The page is
    /// marked dirty for `tid` under the same write guard as the mutation,
    /// so eviction can never observe the new bytes as clean.
    pub fn insert_tuple(
        &self,
        tid: TransactionId,
        cache: &PageCache,
        tuple: &mut Tuple,
    ) -> DbResult<()> {
        let mut scanned = 0;
        loop {
            let count = self.file.page_count()?;
            for page_no in scanned..count {
                let pid = PageId::new(self.table_id, page_no);
                let page_ref = cache.get_page(tid, pid, LockMode::Exclusive)?;
                let mut page = page_ref.write();
                let slot = HeapPageMut::new(page.data_mut(), self.schema).insert(tuple.values())?;
                if let Some(slot) = slot {
                    page.mark_dirty(tid);
                    tuple.set_rid(RecordId { pid, slot });
                    return Ok(());
                }
            }
            scanned = count;

            // Every page scanned so far is full: materialize a fresh zeroed
            // page on disk, then run it through the cache like any other
            // page so locking and eviction accounting see it. If another
            // inserter grew the file first, rescan its page instead of
            // zeroing over it.
            let guard = self.grow.lock();
            if self.file.page_count()? == count {
                self.file.write_page(count, &[0u8; PAGE_SIZE])?;
            }
            drop(guard);
        }
    }

    /// Deletes the tuple at its record id, dirtying the page in the same
    /// guard scope as the mutation.
    pub fn delete_tuple(
        &self,
        tid: TransactionId,
        cache: &PageCache,
        tuple: &Tuple,
    ) -> DbResult<()> {
        let rid = tuple.rid().ok_or(DbError::MissingRecordId)?;
        if rid.pid.table_id != self.table_id {
            return Err(DbError::UnknownTable(rid.pid.table_id));
        }
        let page_ref = cache.get_page(tid, rid.pid, LockMode::Exclusive)?;
        let mut page = page_ref.write();
        HeapPageMut::new(page.data_mut(), self.schema).delete(rid.slot)?;
        page.mark_dirty(tid);
        Ok(())
    }

    /// Reads every stored tuple under shared locks.
    pub fn scan(&self, tid: TransactionId, cache: &PageCache) -> DbResult<Vec<Tuple>> {
        let mut tuples = Vec::new();
        for page_no in 0..self.file.page_count()? {
            let pid = PageId::new(self.table_id, page_no);
            let page_ref = cache.get_page(tid, pid, LockMode::Shared)?;
            let page = page_ref.read();
            let heap = HeapPage::new(page.data(), self.schema);
            for slot in 0..heap.slot_count() {
                if heap.is_used(slot) {
                    tuples.push(Tuple::with_rid(
                        heap.values_at(slot)?,
                        RecordId { pid, slot },
                    ));
                }
            }
        }
        Ok(tuples)
    }
}

impl PageStore for HeapFile {
    fn read_page(&self, pid: PageId) -> DbResult<Page> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.file.read_page(pid, &mut buf)?;
        Ok(Page::new(pid, buf))
    }

    fn write_page(&self, page: &Page) -> DbResult<()> {
        self.file.write_page(page.id().page_no, page.data())
    }

    fn page_count(&self) -> DbResult<u32> {
        self.file.page_count()
    }
}
