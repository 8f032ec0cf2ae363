use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::common::types::{Lsn, PageId, Rid, Tuple, TxnId, INVALID_LSN};

/// Error type for log record operations
#[derive(Error, Debug)]
pub enum LogRecordError {
    #[error("Incomplete log record")]
    Incomplete,

    #[error("Unknown log record type: {0}")]
    UnknownType(u8),

    #[error("Log record too short: {0} bytes")]
    TooShort(usize),
}

/// Result type for log record operations
pub type Result<T> = std::result::Result<T, LogRecordError>;

/// Fixed header preceding every log record:
/// `{ size: u32, lsn: i32, txn_id: i32, prev_lsn: i32, type: u8, pad[3] }`
pub const LOG_HEADER_SIZE: usize = 20;

/// Wire tag for each record type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    Invalid = 0,
    Insert = 1,
    MarkDelete = 2,
    ApplyDelete = 3,
    RollbackDelete = 4,
    Update = 5,
    Begin = 6,
    Commit = 7,
    Abort = 8,
    NewPage = 9,
}

impl LogRecordType {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Insert,
            2 => Self::MarkDelete,
            3 => Self::ApplyDelete,
            4 => Self::RollbackDelete,
            5 => Self::Update,
            6 => Self::Begin,
            7 => Self::Commit,
            8 => Self::Abort,
            9 => Self::NewPage,
            other => return Err(LogRecordError::UnknownType(other)),
        })
    }
}

/// Type-specific payload of a log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Insert { rid: Rid, tuple: Tuple },
    MarkDelete { rid: Rid, tuple: Tuple },
    ApplyDelete { rid: Rid, tuple: Tuple },
    RollbackDelete { rid: Rid, tuple: Tuple },
    Update { rid: Rid, old_tuple: Tuple, new_tuple: Tuple },
    NewPage { prev_page_id: PageId, page_id: PageId },
}

/// A write-ahead log record: shared header plus typed payload. `lsn` and
/// `size` are assigned by the log manager when the record is appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub size: u32,
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub payload: LogPayload,
}

impl LogRecord {
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, payload: LogPayload) -> Self {
        let mut record = Self {
            size: 0,
            lsn: INVALID_LSN,
            txn_id,
            prev_lsn,
            payload,
        };
        record.size = record.serialized_size() as u32;
        record
    }

    pub fn new_begin(txn_id: TxnId) -> Self {
        Self::new(txn_id, INVALID_LSN, LogPayload::Begin)
    }

    pub fn new_commit(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogPayload::Commit)
    }

    pub fn new_abort(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogPayload::Abort)
    }

    pub fn new_insert(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(txn_id, prev_lsn, LogPayload::Insert { rid, tuple })
    }

    pub fn new_mark_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(txn_id, prev_lsn, LogPayload::MarkDelete { rid, tuple })
    }

    pub fn new_apply_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(txn_id, prev_lsn, LogPayload::ApplyDelete { rid, tuple })
    }

    pub fn new_rollback_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(txn_id, prev_lsn, LogPayload::RollbackDelete { rid, tuple })
    }

    pub fn new_update(
        txn_id: TxnId,
        prev_lsn: Lsn,
        rid: Rid,
        old_tuple: Tuple,
        new_tuple: Tuple,
    ) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            },
        )
    }

    pub fn new_new_page(txn_id: TxnId, prev_lsn: Lsn, prev_page_id: PageId, page_id: PageId) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogPayload::NewPage {
                prev_page_id,
                page_id,
            },
        )
    }

    pub fn record_type(&self) -> LogRecordType {
        match &self.payload {
            LogPayload::Begin => LogRecordType::Begin,
            LogPayload::Commit => LogRecordType::Commit,
            LogPayload::Abort => LogRecordType::Abort,
            LogPayload::Insert { .. } => LogRecordType::Insert,
            LogPayload::MarkDelete { .. } => LogRecordType::MarkDelete,
            LogPayload::ApplyDelete { .. } => LogRecordType::ApplyDelete,
            LogPayload::RollbackDelete { .. } => LogRecordType::RollbackDelete,
            LogPayload::Update { .. } => LogRecordType::Update,
            LogPayload::NewPage { .. } => LogRecordType::NewPage,
        }
    }

    /// Total wire size: header plus payload
    pub fn serialized_size(&self) -> usize {
        let payload = match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => 0,
            LogPayload::Insert { tuple, .. }
            | LogPayload::MarkDelete { tuple, .. }
            | LogPayload::ApplyDelete { tuple, .. }
            | LogPayload::RollbackDelete { tuple, .. } => {
                Rid::SERIALIZED_SIZE + tuple.serialized_size()
            }
            LogPayload::Update {
                old_tuple,
                new_tuple,
                ..
            } => Rid::SERIALIZED_SIZE + old_tuple.serialized_size() + new_tuple.serialized_size(),
            LogPayload::NewPage { .. } => 8,
        };
        LOG_HEADER_SIZE + payload
    }

    /// Serialize into `buf`, which must hold at least `serialized_size()`
    /// bytes
    pub fn serialize_into(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.size);
        LittleEndian::write_i32(&mut buf[4..8], self.lsn);
        LittleEndian::write_i32(&mut buf[8..12], self.txn_id);
        LittleEndian::write_i32(&mut buf[12..16], self.prev_lsn);
        buf[16] = self.record_type() as u8;
        buf[17..20].fill(0);

        let mut pos = LOG_HEADER_SIZE;
        match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => {}
            LogPayload::Insert { rid, tuple }
            | LogPayload::MarkDelete { rid, tuple }
            | LogPayload::ApplyDelete { rid, tuple }
            | LogPayload::RollbackDelete { rid, tuple } => {
                rid.serialize_into(&mut buf[pos..]);
                pos += Rid::SERIALIZED_SIZE;
                tuple.serialize_into(&mut buf[pos..]);
            }
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            } => {
                rid.serialize_into(&mut buf[pos..]);
                pos += Rid::SERIALIZED_SIZE;
                old_tuple.serialize_into(&mut buf[pos..]);
                pos += old_tuple.serialized_size();
                new_tuple.serialize_into(&mut buf[pos..]);
            }
            LogPayload::NewPage {
                prev_page_id,
                page_id,
            } => {
                LittleEndian::write_i32(&mut buf[pos..pos + 4], *prev_page_id);
                LittleEndian::write_i32(&mut buf[pos + 4..pos + 8], *page_id);
            }
        }
    }

    /// Deserialize a record from the front of `buf`. Fails with
    /// `Incomplete` when the buffer does not hold the whole record (a zero
    /// size field marks the zero-filled tail of the log).
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < LOG_HEADER_SIZE {
            return Err(LogRecordError::TooShort(buf.len()));
        }

        let size = LittleEndian::read_u32(&buf[0..4]);
        if size == 0 {
            return Err(LogRecordError::Incomplete);
        }
        if (size as usize) < LOG_HEADER_SIZE || buf.len() < size as usize {
            return Err(LogRecordError::Incomplete);
        }

        let lsn = LittleEndian::read_i32(&buf[4..8]);
        let txn_id = LittleEndian::read_i32(&buf[8..12]);
        let prev_lsn = LittleEndian::read_i32(&buf[12..16]);
        let record_type = LogRecordType::from_u8(buf[16])?;

        let body = &buf[LOG_HEADER_SIZE..size as usize];
        let payload = match record_type {
            LogRecordType::Begin => LogPayload::Begin,
            LogRecordType::Commit => LogPayload::Commit,
            LogRecordType::Abort => LogPayload::Abort,
            LogRecordType::Insert => {
                let (rid, tuple) = read_rid_tuple(body)?;
                LogPayload::Insert { rid, tuple }
            }
            LogRecordType::MarkDelete => {
                let (rid, tuple) = read_rid_tuple(body)?;
                LogPayload::MarkDelete { rid, tuple }
            }
            LogRecordType::ApplyDelete => {
                let (rid, tuple) = read_rid_tuple(body)?;
                LogPayload::ApplyDelete { rid, tuple }
            }
            LogRecordType::RollbackDelete => {
                let (rid, tuple) = read_rid_tuple(body)?;
                LogPayload::RollbackDelete { rid, tuple }
            }
            LogRecordType::Update => {
                if body.len() < Rid::SERIALIZED_SIZE + 8 {
                    return Err(LogRecordError::TooShort(body.len()));
                }
                let rid = Rid::deserialize_from(body);
                let old_tuple = Tuple::deserialize_from(&body[Rid::SERIALIZED_SIZE..]);
                let new_offset = Rid::SERIALIZED_SIZE + old_tuple.serialized_size();
                let new_tuple = Tuple::deserialize_from(&body[new_offset..]);
                LogPayload::Update {
                    rid,
                    old_tuple,
                    new_tuple,
                }
            }
            LogRecordType::NewPage => {
                if body.len() < 8 {
                    return Err(LogRecordError::TooShort(body.len()));
                }
                LogPayload::NewPage {
                    prev_page_id: LittleEndian::read_i32(&body[0..4]),
                    page_id: LittleEndian::read_i32(&body[4..8]),
                }
            }
            LogRecordType::Invalid => return Err(LogRecordError::UnknownType(0)),
        };

        Ok(Self {
            size,
            lsn,
            txn_id,
            prev_lsn,
            payload,
        })
    }
}

fn read_rid_tuple(body: &[u8]) -> Result<(Rid, Tuple)> {
    if body.len() < Rid::SERIALIZED_SIZE + 4 {
        return Err(LogRecordError::TooShort(body.len()));
    }
    let rid = Rid::deserialize_from(body);
    let tuple = Tuple::deserialize_from(&body[Rid::SERIALIZED_SIZE..]);
    Ok((rid, tuple))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(mut record: LogRecord) -> LogRecord {
        record.lsn = 40;
        let mut buf = vec![0u8; record.serialized_size()];
        record.serialize_into(&mut buf);
        let decoded = LogRecord::deserialize(&buf).unwrap();
        assert_eq!(decoded, record);
        decoded
    }

    #[test]
    fn test_begin_roundtrip() {
        let record = roundtrip(LogRecord::new_begin(3));
        assert_eq!(record.prev_lsn, INVALID_LSN);
        assert_eq!(record.size as usize, LOG_HEADER_SIZE);
        assert_eq!(record.record_type(), LogRecordType::Begin);
    }

    #[test]
    fn test_insert_roundtrip() {
        let record = roundtrip(LogRecord::new_insert(
            7,
            20,
            Rid::new(2, 5),
            Tuple::new(vec![9, 8, 7]),
        ));
        match record.payload {
            LogPayload::Insert { rid, tuple } => {
                assert_eq!(rid, Rid::new(2, 5));
                assert_eq!(tuple.data(), &[9, 8, 7]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_update_roundtrip() {
        roundtrip(LogRecord::new_update(
            1,
            60,
            Rid::new(4, 0),
            Tuple::new(vec![1; 10]),
            Tuple::new(vec![2; 3]),
        ));
    }

    #[test]
    fn test_new_page_roundtrip() {
        let record = roundtrip(LogRecord::new_new_page(2, 80, 5, 6));
        assert_eq!(
            record.payload,
            LogPayload::NewPage {
                prev_page_id: 5,
                page_id: 6
            }
        );
    }

    #[test]
    fn test_zero_tail_is_incomplete() {
        let buf = [0u8; 64];
        assert!(matches!(
            LogRecord::deserialize(&buf),
            Err(LogRecordError::Incomplete)
        ));
    }
}
