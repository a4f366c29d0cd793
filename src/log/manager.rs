//! Append-only log file with an active-transaction table, rollback, and
//! checkpointing.
//!
//! The coarse mutex over the file doubles as the mutual-exclusion point for
//! rollback, checkpointing, and recovery. Forcing the log before any dirty
//! page write is the cache's responsibility; this module only appends,
//! forces, and walks records.

use crate::catalog::Catalog;
use crate::error::{DbError, DbResult};
use crate::log::record::{LogRecord, PageImage, LOG_HEADER_SIZE, NO_CHECKPOINT};
use crate::storage::buffer::PageCache;
use crate::storage::disk::PageStore;
use crate::storage::page::Page;
use crate::transaction::TransactionId;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

pub struct LogManager {
    catalog: Arc<Catalog>,
    inner: Mutex<LogInner>,
}

pub(super) struct LogInner {
    pub(super) file: File,
    /// Offset one past the last complete record.
    pub(super) end: u64,
    /// Active transactions and the offset of their BEGIN record.
    pub(super) active: HashMap<TransactionId, u64>,
    /// Largest transaction id seen in the log, 0 when none.
    pub(super) max_tid: u64,
}

impl LogManager {
    /// Opens (or creates) the log at `path`. An existing log is scanned
    /// forward to rebuild the active-transaction table, the append offset,
    /// and the largest transaction id; a torn tail from a crash mid-append
    /// is truncated away.
    pub fn open(path: &Path, catalog: Arc<Catalog>) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let mut inner = LogInner {
            file,
            end: LOG_HEADER_SIZE,
            active: HashMap::new(),
            max_tid: 0,
        };

        if len < LOG_HEADER_SIZE {
            inner.set_checkpoint_pointer(NO_CHECKPOINT)?;
            inner.file.set_len(LOG_HEADER_SIZE)?;
            inner.force()?;
        } else {
            inner.rescan(len)?;
        }
        Ok(Self { catalog, inner: Mutex::new(inner) })
    }

    /// Appends a BEGIN record and marks the transaction active.
    pub fn log_begin(&self, tid: TransactionId) -> DbResult<()> {
        let mut inner = self.inner.lock();
        if inner.active.contains_key(&tid) {
            return Err(DbError::LogConsistency(format!(
                "BEGIN for already-active transaction {tid}"
            )));
        }
        let offset = inner.append(&LogRecord::Begin { tid })?;
        inner.active.insert(tid, offset);
        inner.note_tid(tid);
        Ok(())
    }

    /// Appends an UPDATE record carrying full before and after images.
    /// Deliberately no active-transaction check: the cache also logs
    /// updates for committed transactions whose pages flush later.
    pub fn log_write(
        &self,
        tid: TransactionId,
        before: PageImage,
        after: PageImage,
    ) -> DbResult<u64> {
        let mut inner = self.inner.lock();
        let offset = inner.append(&LogRecord::Update { tid, before, after })?;
        inner.note_tid(tid);
        Ok(offset)
    }

    /// Appends a COMMIT record and forces it to disk before returning.
    pub fn log_commit(&self, tid: TransactionId) -> DbResult<()> {
        let mut inner = self.inner.lock();
        if !inner.active.contains_key(&tid) {
            return Err(DbError::LogConsistency(format!(
                "COMMIT for transaction {tid} that is not active"
            )));
        }
        inner.append(&LogRecord::Commit { tid })?;
        inner.force()?;
        inner.active.remove(&tid);
        Ok(())
    }

    /// Undoes the transaction's logged updates and appends its ABORT
    /// record. See [`LogInner::rollback`].
    pub fn log_abort(&self, tid: TransactionId, cache: &PageCache) -> DbResult<()> {
        let mut inner = self.inner.lock();
        inner.rollback(tid, cache, &self.catalog)
    }

    /// Takes a checkpoint: flushes every cached page, appends a CHECKPOINT
    /// record naming the active transactions, and repoints the header at
    /// it. Recovery then starts its scan there instead of at the log head.
    pub fn log_checkpoint(&self, cache: &PageCache) -> DbResult<()> {
        // Flush before taking the log mutex: flushing appends UPDATE
        // records and forces the log itself.
        cache.flush_all_pages()?;

        let mut inner = self.inner.lock();
        let mut active: Vec<TransactionId> = inner.active.keys().copied().collect();
        active.sort_unstable();
        let offset = inner.append(&LogRecord::Checkpoint { active })?;
        inner.force()?;
        inner.set_checkpoint_pointer(offset as i64)?;
        inner.force()?;
        Ok(())
    }

    /// Forces all appended records to disk.
    pub fn force(&self) -> DbResult<()> {
        self.inner.lock().force()
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let inner = self.inner.lock();
        let mut tids: Vec<TransactionId> = inner.active.keys().copied().collect();
        tids.sort_unstable();
        tids
    }

    /// Largest transaction id appearing anywhere in the log.
    pub fn max_tid(&self) -> u64 {
        self.inner.lock().max_tid
    }

    /// Renders every record for inspection, one line each.
    pub fn dump(&self) -> DbResult<Vec<String>> {
        let mut inner = self.inner.lock();
        let pointer = inner.checkpoint_pointer()?;
        let mut lines = vec![format!("checkpoint pointer: {pointer}")];
        let mut pos = LOG_HEADER_SIZE;
        while pos < inner.end {
            let record = inner.record_at(pos)?;
            lines.push(format!("{pos:>8}  {}", record.describe()));
            pos = inner.file.stream_position()?;
        }
        Ok(lines)
    }

    pub(super) fn lock_inner(&self) -> parking_lot::MutexGuard<'_, LogInner> {
        self.inner.lock()
    }

    pub(super) fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}

impl LogInner {
    /// Appends one record at the current end and returns its offset.
    pub(super) fn append(&mut self, record: &LogRecord) -> DbResult<u64> {
        let start = self.end;
        let bytes = record.encode(start)?;
        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(&bytes)?;
        self.end = start + bytes.len() as u64;
        Ok(start)
    }

    pub(super) fn force(&mut self) -> DbResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Decodes the record starting at `offset`, leaving the file cursor
    /// just past it.
    pub(super) fn record_at(&mut self, offset: u64) -> DbResult<LogRecord> {
        self.file.seek(SeekFrom::Start(offset))?;
        LogRecord::decode(&mut self.file)
    }

    /// Reads the trailing self-offset of the record ending at `end`.
    pub(super) fn start_of_record_ending_at(&mut self, end: u64) -> DbResult<u64> {
        self.file.seek(SeekFrom::Start(end - 8))?;
        let start = self.file.read_i64::<BigEndian>()?;
        if start < LOG_HEADER_SIZE as i64 || start as u64 >= end {
            return Err(DbError::LogConsistency(format!(
                "record trailer at {end} points outside the log ({start})"
            )));
        }
        Ok(start as u64)
    }

    pub(super) fn checkpoint_pointer(&mut self) -> DbResult<i64> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(self.file.read_i64::<BigEndian>()?)
    }

    pub(super) fn set_checkpoint_pointer(&mut self, offset: i64) -> DbResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_i64::<BigEndian>(offset)?;
        Ok(())
    }

    pub(super) fn note_tid(&mut self, tid: TransactionId) {
        self.max_tid = self.max_tid.max(tid.value());
    }

    /// Forward scan of an existing log, rebuilding in-memory state. A
    /// record cut short by a crash is dropped along with everything after
    /// it.
    fn rescan(&mut self, len: u64) -> DbResult<()> {
        let mut pos = LOG_HEADER_SIZE;
        while pos < len {
            let record = match self.record_at(pos) {
                Ok(record) => record,
                Err(DbError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            let next = self.file.stream_position()?;
            if next > len {
                break;
            }
            match record {
                LogRecord::Begin { tid } => {
                    self.active.insert(tid, pos);
                }
                LogRecord::Commit { tid } | LogRecord::Abort { tid } => {
                    self.active.remove(&tid);
                }
                LogRecord::Update { .. }
                | LogRecord::Clr { .. }
                | LogRecord::Checkpoint { .. } => {}
            }
            if let Some(tid) = record.tid() {
                self.note_tid(tid);
            }
            if let LogRecord::Checkpoint { ref active } = record {
                for tid in active {
                    self.note_tid(*tid);
                }
            }
            pos = next;
        }
        self.end = pos;
        self.file.set_len(pos)?;
        Ok(())
    }

    /// Walks the log backward from its end, restoring the before-image of
    /// every update by `tid` and appending a CLR for each, until reaching
    /// the transaction's BEGIN, where it appends a forced ABORT record.
    /// CLRs themselves are never undone.
    pub(super) fn rollback(
        &mut self,
        tid: TransactionId,
        cache: &PageCache,
        catalog: &Catalog,
    ) -> DbResult<()> {
        if !self.active.contains_key(&tid) {
            return Err(DbError::LogConsistency(format!(
                "rollback of transaction {tid} that is not active"
            )));
        }

        let mut cursor = self.end;
        while cursor > LOG_HEADER_SIZE {
            let start = self.start_of_record_ending_at(cursor)?;
            let record = self.record_at(start)?;
            if record.tid() == Some(tid) {
                match record {
                    LogRecord::Update { before, .. } => {
                        cache.discard_page(before.id);
                        let table = catalog.table(before.id.table_id)?;
                        table.write_page(&Page::new(before.id, before.data.clone()))?;
                        self.append(&LogRecord::Clr { tid, after: before })?;
                    }
                    LogRecord::Begin { .. } => {
                        self.append(&LogRecord::Abort { tid })?;
                        self.force()?;
                        self.active.remove(&tid);
                        return Ok(());
                    }
                    LogRecord::Commit { .. } | LogRecord::Abort { .. } => {
                        return Err(DbError::LogConsistency(format!(
                            "found COMMIT/ABORT for active transaction {tid} during rollback"
                        )));
                    }
                    LogRecord::Clr { .. } | LogRecord::Checkpoint { .. } => {}
                }
            }
            cursor = start;
        }
        Err(DbError::LogConsistency(format!(
            "no BEGIN record found for transaction {tid}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> LogManager {
        LogManager::open(&dir.join("wal.log"), Arc::new(Catalog::new())).unwrap()
    }

    fn tid(n: u64) -> TransactionId {
        TransactionId::new(n)
    }

    #[test]
    fn test_begin_commit_tracks_active_set() {
        let dir = tempdir().unwrap();
        let lm = open(dir.path());

        lm.log_begin(tid(1)).unwrap();
        lm.log_begin(tid(2)).unwrap();
        assert_eq!(lm.active_transactions(), vec![tid(1), tid(2)]);

        lm.log_commit(tid(1)).unwrap();
        assert_eq!(lm.active_transactions(), vec![tid(2)]);
    }

    #[test]
    fn test_double_begin_is_corruption() {
        let dir = tempdir().unwrap();
        let lm = open(dir.path());
        lm.log_begin(tid(1)).unwrap();
        assert!(matches!(
            lm.log_begin(tid(1)).unwrap_err(),
            DbError::LogConsistency(_)
        ));
    }

    #[test]
    fn test_commit_of_unknown_transaction_is_corruption() {
        let dir = tempdir().unwrap();
        let lm = open(dir.path());
        assert!(matches!(
            lm.log_commit(tid(5)).unwrap_err(),
            DbError::LogConsistency(_)
        ));
    }

    #[test]
    fn test_reopen_rebuilds_active_set_and_max_tid() {
        let dir = tempdir().unwrap();
        {
            let lm = open(dir.path());
            lm.log_begin(tid(3)).unwrap();
            lm.log_begin(tid(7)).unwrap();
            lm.log_commit(tid(3)).unwrap();
            lm.force().unwrap();
        }

        let lm = open(dir.path());
        assert_eq!(lm.active_transactions(), vec![tid(7)]);
        assert_eq!(lm.max_tid(), 7);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let len_after_first = {
            let lm = LogManager::open(&path, Arc::new(Catalog::new())).unwrap();
            lm.log_begin(tid(1)).unwrap();
            lm.force().unwrap();
            std::fs::metadata(&path).unwrap().len()
        };

        // Simulate a crash mid-append: half a record past the good tail.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&crate::log::record::BEGIN_RECORD.to_be_bytes());
        bytes.extend_from_slice(&2i64.to_be_bytes()[..4]);
        std::fs::write(&path, &bytes).unwrap();

        let lm = LogManager::open(&path, Arc::new(Catalog::new())).unwrap();
        assert_eq!(lm.active_transactions(), vec![tid(1)]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_after_first);
    }

    #[test]
    fn test_dump_renders_each_record() {
        let dir = tempdir().unwrap();
        let lm = open(dir.path());
        lm.log_begin(tid(1)).unwrap();
        lm.log_commit(tid(1)).unwrap();

        let dump = lm.dump().unwrap();
        assert_eq!(dump[0], "checkpoint pointer: -1");
        assert!(dump[1].ends_with("<T1 BEGIN>"));
        assert!(dump[2].ends_with("<T1 COMMIT>"));
    }
}
