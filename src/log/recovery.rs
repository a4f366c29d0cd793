//! ARIES-style crash recovery: analysis, blind redo, backward undo.
//!
//! Runs with the database quiesced, before any new transaction starts. The
//! whole pass holds the log mutex, so rollback and checkpointing cannot
//! interleave with it.

use crate::error::{DbError, DbResult};
use crate::log::manager::LogManager;
use crate::log::record::{LogRecord, PageImage, LOG_HEADER_SIZE, NO_CHECKPOINT};
use crate::storage::buffer::PageCache;
use crate::storage::disk::PageStore;
use crate::storage::page::Page;
use crate::transaction::TransactionId;
use log::info;
use std::collections::HashSet;
use std::io::Seek;

impl LogManager {
    /// Brings the on-disk tables to a state reflecting exactly the
    /// committed transactions.
    ///
    /// Analysis seeds the loser set from the checkpoint record the header
    /// points at (or starts empty at the log head). Redo then replays every
    /// after-image forward, blindly; replaying is idempotent because images
    /// are full pages. Undo finally walks backward restoring before-images
    /// for losers, appending CLRs and ABORTs exactly as a live rollback
    /// would, so a crash during recovery just recovers again.
    pub fn recover(&self, cache: &PageCache) -> DbResult<()> {
        let mut inner = self.lock_inner();

        // Analysis.
        let mut losers: HashSet<TransactionId> = HashSet::new();
        let pointer = inner.checkpoint_pointer()?;
        let mut pos = if pointer == NO_CHECKPOINT {
            LOG_HEADER_SIZE
        } else {
            match inner.record_at(pointer as u64)? {
                LogRecord::Checkpoint { active } => {
                    losers.extend(active);
                }
                other => {
                    return Err(DbError::LogConsistency(format!(
                        "checkpoint pointer references a {} record",
                        other.describe()
                    )))
                }
            }
            inner.file.stream_position()?
        };

        // Redo.
        let end = inner.end;
        while pos < end {
            let record = inner.record_at(pos)?;
            pos = inner.file.stream_position()?;
            match record {
                LogRecord::Begin { tid } => {
                    if !losers.insert(tid) {
                        return Err(DbError::LogConsistency(format!(
                            "BEGIN for already-active transaction {tid} during redo"
                        )));
                    }
                }
                LogRecord::Commit { tid } | LogRecord::Abort { tid } => {
                    if !losers.remove(&tid) {
                        return Err(DbError::LogConsistency(format!(
                            "COMMIT/ABORT for transaction {tid} that never began"
                        )));
                    }
                }
                LogRecord::Update { after, .. } | LogRecord::Clr { after, .. } => {
                    self.replay_image(cache, &after)?;
                }
                LogRecord::Checkpoint { .. } => {
                    return Err(DbError::LogConsistency(
                        "checkpoint record past the checkpoint pointer".to_string(),
                    ))
                }
            }
        }
        info!("recovery redo complete, {} loser(s)", losers.len());

        // Undo: from the pre-undo end backward; appended CLRs and ABORTs
        // land past `end` and are never revisited.
        let mut cursor = end;
        while cursor > LOG_HEADER_SIZE && !losers.is_empty() {
            let start = inner.start_of_record_ending_at(cursor)?;
            let record = inner.record_at(start)?;
            if let Some(tid) = record.tid() {
                if losers.contains(&tid) {
                    match record {
                        LogRecord::Update { before, .. } => {
                            self.replay_image(cache, &before)?;
                            inner.append(&LogRecord::Clr { tid, after: before })?;
                        }
                        LogRecord::Begin { .. } => {
                            inner.append(&LogRecord::Abort { tid })?;
                            losers.remove(&tid);
                        }
                        LogRecord::Commit { .. } | LogRecord::Abort { .. } => {
                            return Err(DbError::LogConsistency(format!(
                                "COMMIT/ABORT for loser transaction {tid} during undo"
                            )));
                        }
                        LogRecord::Clr { .. } | LogRecord::Checkpoint { .. } => {}
                    }
                }
            }
            cursor = start;
        }
        if !losers.is_empty() {
            return Err(DbError::LogConsistency(format!(
                "{} loser(s) without a BEGIN record",
                losers.len()
            )));
        }

        inner.force()?;
        inner.active.clear();
        info!("recovery complete");
        Ok(())
    }

    /// Drops any cached copy of the page and writes the image straight to
    /// its table file.
    fn replay_image(&self, cache: &PageCache, image: &PageImage) -> DbResult<()> {
        cache.discard_page(image.id);
        let table = self.catalog().table(image.id.table_id)?;
        table.write_page(&Page::new(image.id, image.data.clone()))
    }
}
