//! Log record codec.
//!
//! Every record is laid out as
//! `[4-byte type][8-byte tid][payload][8-byte self-offset]`, big-endian.
//! BEGIN/COMMIT/ABORT carry no payload; UPDATE carries a before and an
//! after page image; CLR carries only an after image; CHECKPOINT carries a
//! 4-byte count followed by that many 8-byte transaction ids (its tid field
//! is the `-1` sentinel). A page image is the page id pair followed by the
//! raw page bytes.

use crate::error::{DbError, DbResult};
use crate::storage::page::{PageId, PAGE_SIZE};
use crate::transaction::TransactionId;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Size of the checkpoint pointer at the head of the log file.
pub const LOG_HEADER_SIZE: u64 = 8;

/// Checkpoint pointer sentinel: no checkpoint taken yet.
pub const NO_CHECKPOINT: i64 = -1;

pub const ABORT_RECORD: i32 = 1;
pub const COMMIT_RECORD: i32 = 2;
pub const UPDATE_RECORD: i32 = 3;
pub const BEGIN_RECORD: i32 = 4;
pub const CHECKPOINT_RECORD: i32 = 5;
pub const CLR_RECORD: i32 = 6;

/// Full snapshot of a page's bytes, as stored in UPDATE and CLR records.
#[derive(Clone)]
pub struct PageImage {
    pub id: PageId,
    pub data: Box<[u8; PAGE_SIZE]>,
}

impl PageImage {
    pub fn new(id: PageId, data: &[u8; PAGE_SIZE]) -> Self {
        Self {
            id,
            data: Box::new(*data),
        }
    }

    fn encode<W: Write>(&self, w: &mut W) -> DbResult<()> {
        w.write_u32::<BigEndian>(self.id.table_id)?;
        w.write_u32::<BigEndian>(self.id.page_no)?;
        w.write_all(&self.data[..])?;
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> DbResult<Self> {
        let table_id = r.read_u32::<BigEndian>()?;
        let page_no = r.read_u32::<BigEndian>()?;
        let mut data = Box::new([0u8; PAGE_SIZE]);
        r.read_exact(&mut data[..])?;
        Ok(Self {
            id: PageId::new(table_id, page_no),
            data,
        })
    }
}

impl std::fmt::Debug for PageImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageImage({})", self.id)
    }
}

/// A decoded log record.
#[derive(Debug, Clone)]
pub enum LogRecord {
    Begin {
        tid: TransactionId,
    },
    Commit {
        tid: TransactionId,
    },
    Abort {
        tid: TransactionId,
    },
    Update {
        tid: TransactionId,
        before: PageImage,
        after: PageImage,
    },
    /// Compensation record written during undo; its after-image is the
    /// restored before-image, so redoing it is idempotent and it is itself
    /// never undone.
    Clr {
        tid: TransactionId,
        after: PageImage,
    },
    Checkpoint {
        active: Vec<TransactionId>,
    },
}

impl LogRecord {
    pub fn tid(&self) -> Option<TransactionId> {
        match self {
            LogRecord::Begin { tid }
            | LogRecord::Commit { tid }
            | LogRecord::Abort { tid }
            | LogRecord::Update { tid, .. }
            | LogRecord::Clr { tid, .. } => Some(*tid),
            LogRecord::Checkpoint { .. } => None,
        }
    }

    fn type_tag(&self) -> i32 {
        match self {
            LogRecord::Begin { .. } => BEGIN_RECORD,
            LogRecord::Commit { .. } => COMMIT_RECORD,
            LogRecord::Abort { .. } => ABORT_RECORD,
            LogRecord::Update { .. } => UPDATE_RECORD,
            LogRecord::Clr { .. } => CLR_RECORD,
            LogRecord::Checkpoint { .. } => CHECKPOINT_RECORD,
        }
    }

    /// Encodes the record, including the trailing offset of its own start.
    pub fn encode(&self, start: u64) -> DbResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(self.type_tag())?;
        buf.write_i64::<BigEndian>(self.tid().map(|t| t.value() as i64).unwrap_or(-1))?;
        match self {
            LogRecord::Begin { .. } | LogRecord::Commit { .. } | LogRecord::Abort { .. } => {}
            LogRecord::Update { before, after, .. } => {
                before.encode(&mut buf)?;
                after.encode(&mut buf)?;
            }
            LogRecord::Clr { after, .. } => {
                after.encode(&mut buf)?;
            }
            LogRecord::Checkpoint { active } => {
                buf.write_i32::<BigEndian>(active.len() as i32)?;
                for tid in active {
                    buf.write_i64::<BigEndian>(tid.value() as i64)?;
                }
            }
        }
        buf.write_i64::<BigEndian>(start as i64)?;
        Ok(buf)
    }

    /// Decodes one full record, consuming its trailing self-offset.
    pub fn decode<R: Read>(r: &mut R) -> DbResult<Self> {
        let tag = r.read_i32::<BigEndian>()?;
        let raw_tid = r.read_i64::<BigEndian>()?;
        let tid = TransactionId::new(raw_tid as u64);
        let record = match tag {
            BEGIN_RECORD => LogRecord::Begin { tid },
            COMMIT_RECORD => LogRecord::Commit { tid },
            ABORT_RECORD => LogRecord::Abort { tid },
            UPDATE_RECORD => {
                let before = PageImage::decode(r)?;
                let after = PageImage::decode(r)?;
                LogRecord::Update { tid, before, after }
            }
            CLR_RECORD => {
                let after = PageImage::decode(r)?;
                LogRecord::Clr { tid, after }
            }
            CHECKPOINT_RECORD => {
                let count = r.read_i32::<BigEndian>()?;
                let mut active = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    active.push(TransactionId::new(r.read_i64::<BigEndian>()? as u64));
                }
                LogRecord::Checkpoint { active }
            }
            other => {
                return Err(DbError::LogConsistency(format!(
                    "unknown log record type {other}"
                )))
            }
        };
        let _start = r.read_i64::<BigEndian>()?;
        Ok(record)
    }

    /// Human-readable one-line rendering, used by the log dump.
    pub fn describe(&self) -> String {
        match self {
            LogRecord::Begin { tid } => format!("<{tid} BEGIN>"),
            LogRecord::Commit { tid } => format!("<{tid} COMMIT>"),
            LogRecord::Abort { tid } => format!("<{tid} ABORT>"),
            LogRecord::Update { tid, before, .. } => {
                format!("<{tid} UPDATE pid={}>", before.id)
            }
            LogRecord::Clr { tid, after } => format!("<{tid} CLR pid={}>", after.id),
            LogRecord::Checkpoint { active } => {
                let tids: Vec<String> = active.iter().map(|t| t.to_string()).collect();
                format!("<CHECKPOINT [{}]>", tids.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(record: LogRecord, start: u64) -> LogRecord {
        let bytes = record.encode(start).unwrap();
        LogRecord::decode(&mut Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn test_control_record_layout() {
        let record = LogRecord::Begin {
            tid: TransactionId::new(9),
        };
        let bytes = record.encode(8).unwrap();
        // type + tid + trailing offset
        assert_eq!(bytes.len(), 4 + 8 + 8);
        assert_eq!(&bytes[..4], &BEGIN_RECORD.to_be_bytes());
        assert_eq!(&bytes[4..12], &9i64.to_be_bytes());
        assert_eq!(&bytes[12..], &8i64.to_be_bytes());
    }

    #[test]
    fn test_update_roundtrip() {
        let mut data = [0u8; PAGE_SIZE];
        data[100] = 7;
        let before = PageImage::new(PageId::new(1, 2), &data);
        data[100] = 8;
        let after = PageImage::new(PageId::new(1, 2), &data);

        let decoded = roundtrip(
            LogRecord::Update {
                tid: TransactionId::new(3),
                before,
                after,
            },
            64,
        );
        match decoded {
            LogRecord::Update { tid, before, after } => {
                assert_eq!(tid, TransactionId::new(3));
                assert_eq!(before.id, PageId::new(1, 2));
                assert_eq!(before.data[100], 7);
                assert_eq!(after.data[100], 8);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let decoded = roundtrip(
            LogRecord::Checkpoint {
                active: vec![TransactionId::new(4), TransactionId::new(11)],
            },
            128,
        );
        match decoded {
            LogRecord::Checkpoint { active } => {
                assert_eq!(active, vec![TransactionId::new(4), TransactionId::new(11)]);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_clr_roundtrip() {
        let image = PageImage::new(PageId::new(5, 6), &[1u8; PAGE_SIZE]);
        let decoded = roundtrip(
            LogRecord::Clr {
                tid: TransactionId::new(2),
                after: image,
            },
            16,
        );
        match decoded {
            LogRecord::Clr { tid, after } => {
                assert_eq!(tid, TransactionId::new(2));
                assert_eq!(after.id, PageId::new(5, 6));
                assert!(after.data.iter().all(|&b| b == 1));
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_corruption() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&99i32.to_be_bytes());
        bytes.extend_from_slice(&1i64.to_be_bytes());
        bytes.extend_from_slice(&8i64.to_be_bytes());
        let err = LogRecord::decode(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, DbError::LogConsistency(_)));
    }
}
