use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Sentinel for "no page"
pub const INVALID_PAGE_ID: PageId = -1;

/// Page id of the header page holding index-name -> root-page records
pub const HEADER_PAGE_ID: PageId = 0;

/// Sentinel for "no log record"
pub const INVALID_LSN: Lsn = -1;

/// Sentinel for "no transaction"
pub const INVALID_TXN_ID: TxnId = -1;

/// Size of each of the two log buffers
pub const LOG_BUFFER_SIZE: usize = PAGE_SIZE * 16;

/// Upper bound on how long the flush worker sleeps between unconditional
/// flush attempts
pub const LOG_TIMEOUT: Duration = Duration::from_secs(1);

/// Fixed bucket capacity of the page-table hash
pub const BUCKET_SIZE: usize = 64;

/// Page ID type
pub type PageId = i32;

/// Transaction ID type
pub type TxnId = i32;

/// Buffer pool frame ID type
pub type FrameId = usize;

/// Slot number within a page
pub type SlotNum = u32;

/// LSN (Log Sequence Number) type; an LSN is a byte offset into the log file
pub type Lsn = i32;

/// Record ID: the physical address of a tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_num: SlotNum,
}

impl Rid {
    /// Wire size of a serialized Rid
    pub const SERIALIZED_SIZE: usize = 8;

    pub fn new(page_id: PageId, slot_num: SlotNum) -> Self {
        Self { page_id, slot_num }
    }

    pub fn serialize_into(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(&mut buf[0..4], self.page_id);
        LittleEndian::write_u32(&mut buf[4..8], self.slot_num);
    }

    pub fn deserialize_from(buf: &[u8]) -> Self {
        Self {
            page_id: LittleEndian::read_i32(&buf[0..4]),
            slot_num: LittleEndian::read_u32(&buf[4..8]),
        }
    }
}

/// Opaque tuple payload with a u32 length-prefixed wire form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuple {
    data: Vec<u8>,
}

impl Tuple {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wire size: u32 length prefix plus payload
    pub fn serialized_size(&self) -> usize {
        4 + self.data.len()
    }

    pub fn serialize_into(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.data.len() as u32);
        buf[4..4 + self.data.len()].copy_from_slice(&self.data);
    }

    pub fn deserialize_from(buf: &[u8]) -> Self {
        let len = LittleEndian::read_u32(&buf[0..4]) as usize;
        Self {
            data: buf[4..4 + len].to_vec(),
        }
    }
}

/// Offset of the page id in every on-disk page
pub const PAGE_ID_OFFSET: usize = 0;
/// Offset of the page LSN in every on-disk page
pub const PAGE_LSN_OFFSET: usize = 4;
/// Every on-disk page starts with page id (4 bytes) and LSN (4 bytes)
pub const PAGE_PREFIX_SIZE: usize = 8;

/// Page structure: raw bytes plus the identity of the resident page.
/// Pin count and dirty flag live in the buffer pool's frame metadata; the
/// surrounding `RwLock` in `PagePtr` is the page latch.
#[derive(Debug, Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        let mut page = Self {
            data: [0; PAGE_SIZE],
            page_id,
        };
        if page_id != INVALID_PAGE_ID {
            page.write_page_id(page_id);
        }
        page
    }

    /// Zero the payload and drop the identity
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.page_id = INVALID_PAGE_ID;
    }

    pub fn set_page_id(&mut self, page_id: PageId) {
        self.page_id = page_id;
        self.write_page_id(page_id);
    }

    fn write_page_id(&mut self, page_id: PageId) {
        LittleEndian::write_i32(
            &mut self.data[PAGE_ID_OFFSET..PAGE_ID_OFFSET + 4],
            page_id,
        );
    }

    /// LSN of the most recent log record reflected in this page image
    pub fn lsn(&self) -> Lsn {
        LittleEndian::read_i32(&self.data[PAGE_LSN_OFFSET..PAGE_LSN_OFFSET + 4])
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        LittleEndian::write_i32(&mut self.data[PAGE_LSN_OFFSET..PAGE_LSN_OFFSET + 4], lsn);
    }
}

/// Smart pointer to a latched page
pub type PagePtr = Arc<RwLock<Page>>;

/// Read latch held across call frames (owns its page reference)
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;

/// Write latch held across call frames (owns its page reference)
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;
