//! The page cache: a fixed-capacity pool of pages shared by all
//! transactions.
//!
//! Every logical page access acquires the page lock first, then consults
//! the cache. Eviction is FIFO by admission time; a hit never refreshes a
//! page's admission stamp. Dirty pages follow steal/no-force: they may be
//! flushed before commit (after their UPDATE record is forced) and need
//! not be flushed at commit.

use crate::access::tuple::Tuple;
use crate::catalog::Catalog;
use crate::concurrency::lock::{LockManager, LockMode};
use crate::error::{DbError, DbResult};
use crate::log::manager::LogManager;
use crate::log::record::PageImage;
use crate::storage::disk::PageStore;
use crate::storage::page::{Page, PageId, PageRef};
use crate::transaction::TransactionId;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Default number of resident pages.
pub const DEFAULT_CACHE_CAPACITY: usize = 50;

pub struct PageCache {
    catalog: Arc<Catalog>,
    locks: Arc<LockManager>,
    log: Arc<LogManager>,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    pages: HashMap<PageId, PageRef>,
    /// Admission stamp per resident page; smaller means admitted earlier.
    admitted: HashMap<PageId, u64>,
    next_stamp: u64,
}

impl PageCache {
    pub fn new(
        catalog: Arc<Catalog>,
        locks: Arc<LockManager>,
        log: Arc<LogManager>,
        capacity: usize,
    ) -> Self {
        Self {
            catalog,
            locks,
            log,
            capacity,
            inner: Mutex::new(CacheInner {
                pages: HashMap::new(),
                admitted: HashMap::new(),
                next_stamp: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fetches a page on behalf of `tid`, blocking until the page lock is
    /// granted or the lock timeout expires. A cache hit keeps the page's
    /// original admission stamp.
    pub fn get_page(
        &self,
        tid: TransactionId,
        pid: PageId,
        mode: LockMode,
    ) -> DbResult<PageRef> {
        self.locks.acquire_lock(pid, tid, mode)?;

        loop {
            let must_evict = {
                let inner = self.inner.lock();
                if let Some(page) = inner.pages.get(&pid) {
                    return Ok(Arc::clone(page));
                }
                inner.pages.len() >= self.capacity
            };
            if must_evict {
                self.evict_one()?;
            }

            // Load outside the map mutex; disk reads must not block hits.
            let table = self.catalog.table(pid.table_id)?;
            let page = table.read_page(pid)?;

            let mut inner = self.inner.lock();
            if let Some(existing) = inner.pages.get(&pid) {
                // Raced with another loader of the same page.
                return Ok(Arc::clone(existing));
            }
            if inner.pages.len() >= self.capacity {
                // An eviction raced against other loaders; retry.
                continue;
            }
            let page_ref: PageRef = Arc::new(RwLock::new(page));
            inner.admit(pid, Arc::clone(&page_ref));
            return Ok(page_ref);
        }
    }

    /// Evicts the oldest-admitted page that can be made clean. Victims are
    /// flushed outside the map mutex and only removed if still clean when
    /// re-examined. Errors with [`DbError::BufferExhausted`] when no
    /// resident page is evictable.
    fn evict_one(&self) -> DbResult<()> {
        let mut candidates: Vec<(u64, PageId, PageRef)> = {
            let inner = self.inner.lock();
            inner
                .pages
                .iter()
                .map(|(&pid, page)| {
                    let stamp = inner.admitted.get(&pid).copied().unwrap_or(u64::MAX);
                    (stamp, pid, Arc::clone(page))
                })
                .collect()
        };
        candidates.sort_by_key(|&(stamp, _, _)| stamp);

        for (_, pid, page_ref) in candidates {
            // try_write: a victim whose lock is held by an active writer
            // stalls eviction, so pass it over instead of blocking.
            let mut page = match page_ref.try_write() {
                Some(page) => page,
                None => continue,
            };
            if let Err(e) = self.flush_locked(&mut page) {
                drop(page);
                warn!("skipping unevictable page {pid}: {e}");
                continue;
            }
            // Still holding the page lock, so it cannot be re-dirtied
            // before removal.
            let mut inner = self.inner.lock();
            let still_resident = inner
                .pages
                .get(&pid)
                .map_or(false, |p| Arc::ptr_eq(p, &page_ref));
            if still_resident {
                inner.pages.remove(&pid);
                inner.admitted.remove(&pid);
                debug!("evicted page {pid}");
                return Ok(());
            }
        }
        Err(DbError::BufferExhausted {
            capacity: self.capacity,
        })
    }

    /// Flushes one page if resident and dirty. Write-ahead: the page's
    /// UPDATE record is appended and the log forced before its bytes reach
    /// the table file. A clean page is a no-op.
    pub fn flush_page(&self, pid: PageId) -> DbResult<()> {
        let page_ref = {
            let inner = self.inner.lock();
            match inner.pages.get(&pid) {
                Some(page) => Arc::clone(page),
                None => return Ok(()),
            }
        };
        self.flush_ref(&page_ref)
    }

    /// Flushes every resident dirty page.
    pub fn flush_all_pages(&self) -> DbResult<()> {
        let pages: Vec<PageRef> = {
            let inner = self.inner.lock();
            inner.pages.values().cloned().collect()
        };
        for page_ref in pages {
            self.flush_ref(&page_ref)?;
        }
        Ok(())
    }

    fn flush_ref(&self, page_ref: &PageRef) -> DbResult<()> {
        let mut page = page_ref.write();
        self.flush_locked(&mut page)
    }

    fn flush_locked(&self, page: &mut Page) -> DbResult<()> {
        let tid = match page.dirtier() {
            Some(tid) => tid,
            None => return Ok(()),
        };
        let before = PageImage::new(page.id(), page.before_image());
        let after = PageImage::new(page.id(), page.data());
        self.log.log_write(tid, before, after)?;
        self.log.force()?;
        self.catalog.table(page.id().table_id)?.write_page(page)?;
        page.mark_clean();
        Ok(())
    }

    /// Drops a page from the cache without writing it anywhere. Used by
    /// rollback and recovery, which restore the on-disk copy directly.
    pub fn discard_page(&self, pid: PageId) {
        let mut inner = self.inner.lock();
        inner.pages.remove(&pid);
        inner.admitted.remove(&pid);
    }

    /// Inserts a tuple into `table_id`. The heap file marks the touched
    /// page dirty while still holding its write guard.
    pub fn insert_tuple(
        &self,
        tid: TransactionId,
        table_id: u32,
        tuple: &mut Tuple,
    ) -> DbResult<()> {
        self.catalog.table(table_id)?.insert_tuple(tid, self, tuple)
    }

    /// Deletes a tuple by its record id.
    pub fn delete_tuple(&self, tid: TransactionId, tuple: &Tuple) -> DbResult<()> {
        let rid = tuple.rid().ok_or(DbError::MissingRecordId)?;
        self.catalog
            .table(rid.pid.table_id)?
            .delete_tuple(tid, self, tuple)
    }

    /// Finishes a transaction.
    ///
    /// Commit logs an UPDATE for every page the transaction dirtied, forces
    /// a COMMIT record, and re-snapshots those pages' before-images; the
    /// pages stay resident and dirty, flushed whenever eviction or a
    /// checkpoint gets to them. Abort rolls the transaction back through
    /// the log and rewinds any still-unlogged dirty page to its
    /// before-image. Both ends release all of the transaction's locks.
    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> DbResult<()> {
        let result = if commit {
            self.commit_pages(tid)
        } else {
            self.abort_pages(tid)
        };
        self.locks.release_all_locks(tid);
        result
    }

    fn commit_pages(&self, tid: TransactionId) -> DbResult<()> {
        let pages: Vec<PageRef> = {
            let inner = self.inner.lock();
            inner.pages.values().cloned().collect()
        };
        let mut dirtied = Vec::new();
        for page_ref in pages {
            let page = page_ref.read();
            if page.dirtier() == Some(tid) {
                let before = PageImage::new(page.id(), page.before_image());
                let after = PageImage::new(page.id(), page.data());
                self.log.log_write(tid, before, after)?;
                drop(page);
                dirtied.push(page_ref);
            }
        }
        self.log.log_commit(tid)?;
        for page_ref in dirtied {
            page_ref.write().set_before_image();
        }
        Ok(())
    }

    fn abort_pages(&self, tid: TransactionId) -> DbResult<()> {
        let rolled_back = self.log.log_abort(tid, self);

        // Rollback discarded the pages it found UPDATE records for. Any
        // remaining page dirtied by tid was never logged, and under
        // no-force commit its before-image (the last committed state) may
        // be newer than the disk copy, so rewind it in place and write it
        // through rather than discarding the entry.
        let pages: Vec<PageRef> = {
            let inner = self.inner.lock();
            inner.pages.values().cloned().collect()
        };
        for page_ref in pages {
            let mut page = page_ref.write();
            if page.dirtier() == Some(tid) {
                page.restore_before_image();
                self.catalog.table(page.id().table_id)?.write_page(&page)?;
                page.mark_clean();
            }
        }
        rolled_back
    }

    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.locks.holds_lock(tid, pid)
    }

    #[cfg(test)]
    fn resident(&self, pid: PageId) -> bool {
        self.inner.lock().pages.contains_key(&pid)
    }
}

impl CacheInner {
    fn admit(&mut self, pid: PageId, page: PageRef) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.pages.insert(pid, page);
        self.admitted.insert(pid, stamp);
    }
}
