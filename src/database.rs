//! The engine's top-level context object: wires the catalog, lock
//! manager, log, and page cache together and owns transaction lifecycle.

use crate::access::tuple::{Schema, Tuple};
use crate::catalog::Catalog;
use crate::access::heap::HeapFile;
use crate::concurrency::lock::{LockManager, DEFAULT_LOCK_TIMEOUT};
use crate::error::DbResult;
use crate::log::manager::LogManager;
use crate::storage::buffer::{PageCache, DEFAULT_CACHE_CAPACITY};
use crate::transaction::{TransactionId, TransactionIdGenerator};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LOG_FILE_NAME: &str = "wal.log";

/// Tunables for [`Database::with_options`].
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub cache_capacity: usize,
    pub lock_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// An open database rooted at a directory: one log file plus one file per
/// table. All shared state hangs off this value; there are no globals, so
/// tests can open several databases side by side.
pub struct Database {
    dir: PathBuf,
    catalog: Arc<Catalog>,
    locks: Arc<LockManager>,
    log: Arc<LogManager>,
    cache: Arc<PageCache>,
    tid_gen: TransactionIdGenerator,
    next_table_id: AtomicU32,
}

impl Database {
    pub fn open(dir: &Path) -> DbResult<Self> {
        Self::with_options(dir, Options::default())
    }

    pub fn with_options(dir: &Path, options: Options) -> DbResult<Self> {
        std::fs::create_dir_all(dir)?;
        let catalog = Arc::new(Catalog::new());
        let log = Arc::new(LogManager::open(&dir.join(LOG_FILE_NAME), Arc::clone(&catalog))?);
        let locks = Arc::new(LockManager::with_timeout(options.lock_timeout));
        let cache = Arc::new(PageCache::new(
            Arc::clone(&catalog),
            Arc::clone(&locks),
            Arc::clone(&log),
            options.cache_capacity,
        ));
        // Never reissue an id that already appears in the log.
        let tid_gen = TransactionIdGenerator::starting_at(log.max_tid() + 1);
        info!("opened database at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            catalog,
            locks,
            log,
            cache,
            tid_gen,
            next_table_id: AtomicU32::new(0),
        })
    }

    /// Creates (or, after a reopen, reattaches) a table stored at
    /// `<dir>/<name>.dat` and returns its id. Ids are assigned in
    /// registration order, so reopening a database must register its
    /// tables in the same order.
    pub fn create_table(&self, name: &str, schema: Schema) -> DbResult<u32> {
        let table_id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("{name}.dat"));
        let table = Arc::new(HeapFile::open_or_create(&path, table_id, schema)?);
        self.catalog.register(table);
        Ok(table_id)
    }

    /// Starts a transaction: assigns an id and logs its BEGIN record.
    pub fn begin(&self) -> DbResult<TransactionId> {
        let tid = self.tid_gen.next();
        self.log.log_begin(tid)?;
        debug!("{tid} begin");
        Ok(tid)
    }

    pub fn commit(&self, tid: TransactionId) -> DbResult<()> {
        debug!("{tid} commit");
        self.cache.transaction_complete(tid, true)
    }

    pub fn abort(&self, tid: TransactionId) -> DbResult<()> {
        debug!("{tid} abort");
        self.cache.transaction_complete(tid, false)
    }

    pub fn insert(&self, tid: TransactionId, table_id: u32, tuple: &mut Tuple) -> DbResult<()> {
        self.cache.insert_tuple(tid, table_id, tuple)
    }

    pub fn delete(&self, tid: TransactionId, tuple: &Tuple) -> DbResult<()> {
        self.cache.delete_tuple(tid, tuple)
    }

    pub fn scan(&self, tid: TransactionId, table_id: u32) -> DbResult<Vec<Tuple>> {
        self.catalog.table(table_id)?.scan(tid, &self.cache)
    }

    /// Runs `body` in a transaction, committing on success. A lock timeout
    /// aborts and retries from scratch, up to a few attempts; any other
    /// error aborts and propagates.
    pub fn transact<T>(
        &self,
        mut body: impl FnMut(TransactionId) -> DbResult<T>,
    ) -> DbResult<T> {
        const MAX_ATTEMPTS: u32 = 5;
        let mut attempt = 1;
        loop {
            let tid = self.begin()?;
            match body(tid) {
                Ok(value) => {
                    self.commit(tid)?;
                    return Ok(value);
                }
                Err(e) if e.is_lock_timeout() && attempt < MAX_ATTEMPTS => {
                    debug!("{tid} retrying after {e}");
                    self.abort(tid)?;
                    attempt += 1;
                }
                Err(e) => {
                    // Abort best-effort; the original error is the one
                    // worth reporting.
                    let _ = self.abort(tid);
                    return Err(e);
                }
            }
        }
    }

    pub fn flush_all(&self) -> DbResult<()> {
        self.cache.flush_all_pages()
    }

    pub fn checkpoint(&self) -> DbResult<()> {
        self.log.log_checkpoint(&self.cache)
    }

    /// Replays the log after a crash. Call before starting transactions.
    pub fn recover(&self) -> DbResult<()> {
        self.log.recover(&self.cache)
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn log(&self) -> &LogManager {
        &self.log
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}
