use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use thiserror::Error;

use crate::common::types::{Lsn, Page, Rid, TxnId, LOG_BUFFER_SIZE};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::disk::{DiskManager, DiskManagerError};
use crate::storage::page::{PageError, TablePage};
use crate::transaction::wal::log_record::{LogPayload, LogRecord, LOG_HEADER_SIZE};

/// Error type for recovery operations
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Disk manager error: {0}")]
    DiskError(#[from] DiskManagerError),

    #[error("Buffer pool error: {0}")]
    BufferError(#[from] BufferPoolError),

    #[error("Page error: {0}")]
    PageError(#[from] PageError),
}

/// Result type for recovery operations
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// REDO-phase crash recovery: scan the log from offset zero and reapply
/// every change whose effect did not reach the page on disk. UNDO is out
/// of scope, but the scan still builds the active-transaction table.
pub struct LogRecovery {
    disk_manager: Arc<DiskManager>,
    buffer_pool: Arc<BufferPoolManager>,
    /// Transactions without a COMMIT record, mapped to their last LSN
    active_txn: HashMap<TxnId, Lsn>,
    /// LSN -> log file offset; the identity map, since LSNs are offsets
    lsn_mapping: HashMap<Lsn, u64>,
}

impl LogRecovery {
    pub fn new(disk_manager: Arc<DiskManager>, buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            disk_manager,
            buffer_pool,
            active_txn: HashMap::new(),
            lsn_mapping: HashMap::new(),
        }
    }

    /// Transactions that were still in flight when the log ends
    pub fn active_transactions(&self) -> &HashMap<TxnId, Lsn> {
        &self.active_txn
    }

    /// Scan the log and reapply un-persisted changes
    pub fn redo(&mut self) -> Result<()> {
        info!("starting REDO pass");
        let mut log_buffer = vec![0u8; LOG_BUFFER_SIZE];
        let mut file_offset: u64 = 0;
        let mut buffer_offset: usize = 0;
        let mut replayed = 0usize;

        if !self.disk_manager.read_log(&mut log_buffer, file_offset)? {
            info!("log file is empty; nothing to redo");
            return Ok(());
        }

        loop {
            // A record spanning the buffer boundary forces a re-read at
            // the record's file offset
            if LOG_BUFFER_SIZE - buffer_offset < LOG_HEADER_SIZE {
                buffer_offset = 0;
                if !self.disk_manager.read_log(&mut log_buffer, file_offset)? {
                    break;
                }
                continue;
            }
            let size = LittleEndian::read_u32(&log_buffer[buffer_offset..buffer_offset + 4]);
            if size == 0 {
                // Zero-filled tail: end of the log
                break;
            }
            if buffer_offset + size as usize > LOG_BUFFER_SIZE {
                if buffer_offset == 0 {
                    // A record can never outgrow the log buffer; this is a
                    // torn or corrupt tail
                    break;
                }
                buffer_offset = 0;
                if !self.disk_manager.read_log(&mut log_buffer, file_offset)? {
                    break;
                }
                continue;
            }

            let record = match LogRecord::deserialize(
                &log_buffer[buffer_offset..buffer_offset + size as usize],
            ) {
                Ok(record) => record,
                Err(_) => break,
            };
            buffer_offset += size as usize;
            self.lsn_mapping.insert(record.lsn, file_offset);
            file_offset += size as u64;

            // Without checkpoints, a transaction's BEGIN is always the
            // first record we see for it
            if matches!(record.payload, LogPayload::Commit) {
                self.active_txn.remove(&record.txn_id);
            } else {
                self.active_txn.insert(record.txn_id, record.lsn);
            }

            if self.redo_record(&record)? {
                replayed += 1;
            }
        }

        info!(
            "REDO pass complete: {} records replayed, {} transactions in flight",
            replayed,
            self.active_txn.len()
        );
        Ok(())
    }

    /// Reapply a single record when its page image predates it. Returns
    /// whether the change was reapplied.
    fn redo_record(&mut self, record: &LogRecord) -> Result<bool> {
        match &record.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => Ok(false),
            LogPayload::Insert { rid, tuple } => self.redo_tuple_op(record, *rid, |page, rid| {
                let replayed_rid = TablePage::insert_tuple(page, tuple)?;
                debug_assert_eq!(replayed_rid, rid, "replayed insert landed on a new slot");
                Ok(())
            }),
            LogPayload::Update {
                rid, new_tuple, ..
            } => self.redo_tuple_op(record, *rid, |page, rid| {
                TablePage::update_tuple(page, rid, new_tuple)?;
                Ok(())
            }),
            LogPayload::MarkDelete { rid, .. } => {
                self.redo_tuple_op(record, *rid, |page, rid| TablePage::mark_delete(page, rid))
            }
            LogPayload::ApplyDelete { rid, .. } => {
                self.redo_tuple_op(record, *rid, |page, rid| TablePage::apply_delete(page, rid))
            }
            LogPayload::RollbackDelete { rid, .. } => self.redo_tuple_op(record, *rid, |page, rid| {
                TablePage::rollback_delete(page, rid)
            }),
            LogPayload::NewPage {
                prev_page_id,
                page_id,
            } => {
                if self.disk_manager.check_page_valid(*page_id) {
                    // The page reached disk; its LSN gate covers it
                    return Ok(false);
                }
                let (page_ptr, new_page_id) = self.buffer_pool.new_page()?;
                debug_assert_eq!(new_page_id, *page_id, "page allocation order diverged");
                {
                    let mut page = page_ptr.write();
                    TablePage::init(&mut page, new_page_id, *prev_page_id);
                    page.set_lsn(record.lsn);
                }
                self.buffer_pool.unpin_page(new_page_id, true)?;
                debug!("redo: rebuilt page {}", new_page_id);
                Ok(true)
            }
        }
    }

    fn redo_tuple_op<F>(&mut self, record: &LogRecord, rid: Rid, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut Page, Rid) -> std::result::Result<(), PageError>,
    {
        let page_ptr = self.buffer_pool.fetch_page(rid.page_id)?;
        let replayed = {
            let mut page = page_ptr.write();
            if page.lsn() >= record.lsn {
                // The change is already durable
                false
            } else {
                apply(&mut page, rid)?;
                page.set_lsn(record.lsn);
                true
            }
        };
        self.buffer_pool.unpin_page(rid.page_id, replayed)?;
        Ok(replayed)
    }
}
