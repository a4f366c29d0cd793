//! Engine-wide error types.

use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use thiserror::Error;

/// Errors that can occur in the storage engine.
#[derive(Error, Debug)]
pub enum DbError {
    /// A lock request was not satisfied within the configured timeout.
    /// Recoverable: abort the transaction and retry it from scratch.
    #[error("lock request timed out: {tid} waiting on page {pid}")]
    LockTimeout { tid: TransactionId, pid: PageId },

    /// No cache slot could be freed: every resident page is dirty and
    /// unflushable.
    #[error("buffer pool exhausted: no evictable page among {capacity} slots")]
    BufferExhausted { capacity: usize },

    /// The log record sequence violates protocol invariants. Treated as
    /// corruption, never recovered automatically.
    #[error("log consistency violation: {0}")]
    LogConsistency(String),

    #[error("unknown table: {0}")]
    UnknownTable(u32),

    #[error("page {0} does not exist in its table file")]
    PageNotFound(PageId),

    #[error("heap page has no free slot")]
    PageFull,

    #[error("tuple has no record id (never inserted?)")]
    MissingRecordId,

    #[error("no tuple in slot {slot}")]
    TupleNotFound { slot: usize },

    #[error("schema mismatch: expected {expected} fields, got {actual}")]
    SchemaMismatch { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// True for the one failure a transaction wrapper may mechanically
    /// retry after aborting.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, DbError::LockTimeout { .. })
    }
}

/// Result type for engine operations.
pub type DbResult<T> = Result<T, DbError>;
