//! Write-ahead log: append-only record file, rollback, checkpointing, and
//! crash recovery.
//!
//! On-disk layout: an 8-byte pointer to the most recent checkpoint record
//! (-1 when none), followed by records. Each record ends with the 8-byte
//! offset of its own start, so the log can be walked backward without an
//! index.

pub mod manager;
pub mod record;
pub mod recovery;

pub use manager::LogManager;
pub use record::LogRecord;
