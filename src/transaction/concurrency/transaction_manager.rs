use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::common::types::{PageId, PagePtr, Rid, Tuple, TxnId};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::page::{PageError, TablePage};
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    Transaction, TransactionState, WriteOp, WriteRecord,
};
use crate::transaction::wal::log_manager::{LogManager, LogManagerError};
use crate::transaction::wal::log_record::LogRecord;

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} is not active")]
    NotActive(TxnId),

    #[error("Buffer pool error: {0}")]
    BufferError(#[from] BufferPoolError),

    #[error("Page error: {0}")]
    PageError(#[from] PageError),

    #[error("WAL error: {0}")]
    LogError(#[from] LogManagerError),
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Creates transactions and drives their lifecycle: begin, logged tuple
/// mutations, group-committed commit, and write-set rollback on abort.
pub struct TransactionManager {
    next_txn_id: AtomicI32,
    lock_manager: Arc<LockManager>,
    log_manager: Option<Arc<LogManager>>,
    buffer_pool: Arc<BufferPoolManager>,
}

impl TransactionManager {
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        lock_manager: Arc<LockManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        Self {
            next_txn_id: AtomicI32::new(0),
            lock_manager,
            log_manager,
            buffer_pool,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Start a new transaction, logging BEGIN when logging is enabled
    pub fn begin(&self) -> Result<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Transaction::new(txn_id);

        if let Some(log_manager) = self.active_log_manager() {
            let mut record = LogRecord::new_begin(txn_id);
            let lsn = log_manager.append_log_record(&mut record)?;
            txn.set_prev_lsn(lsn);
        }

        Ok(txn)
    }

    /// Allocate and initialize a fresh table page under this transaction.
    /// The page is returned pinned.
    pub fn new_table_page(
        &self,
        txn: &Transaction,
        prev_page_id: PageId,
    ) -> Result<(PagePtr, PageId)> {
        self.ensure_active(txn)?;
        let (page_ptr, page_id) = self.buffer_pool.new_page()?;
        {
            let mut page = page_ptr.write();
            TablePage::init(&mut page, page_id, prev_page_id);
            if let Some(log_manager) = self.active_log_manager() {
                let mut record =
                    LogRecord::new_new_page(txn.id(), txn.prev_lsn(), prev_page_id, page_id);
                let lsn = log_manager.append_log_record(&mut record)?;
                txn.set_prev_lsn(lsn);
                page.set_lsn(lsn);
            }
        }
        Ok((page_ptr, page_id))
    }

    /// Insert a tuple into `page_id`, logging the insert and recording it
    /// in the transaction's write set
    pub fn insert_tuple(&self, txn: &Transaction, page_id: PageId, tuple: &Tuple) -> Result<Rid> {
        self.ensure_active(txn)?;
        let page_ptr = self.buffer_pool.fetch_page(page_id)?;
        let rid = {
            let mut page = page_ptr.write();
            let rid = TablePage::insert_tuple(&mut page, tuple)?;
            if let Some(log_manager) = self.active_log_manager() {
                let mut record =
                    LogRecord::new_insert(txn.id(), txn.prev_lsn(), rid, tuple.clone());
                let lsn = log_manager.append_log_record(&mut record)?;
                txn.set_prev_lsn(lsn);
                page.set_lsn(lsn);
            }
            rid
        };
        self.buffer_pool.unpin_page(page_id, true)?;

        txn.push_write_record(WriteRecord::new(WriteOp::Insert, rid, Tuple::default()));
        Ok(rid)
    }

    /// Replace the tuple at `rid`, logging old and new images
    pub fn update_tuple(&self, txn: &Transaction, rid: Rid, new_tuple: &Tuple) -> Result<()> {
        self.ensure_active(txn)?;
        let page_ptr = self.buffer_pool.fetch_page(rid.page_id)?;
        let old = {
            let mut page = page_ptr.write();
            let old = TablePage::update_tuple(&mut page, rid, new_tuple)?;
            if let Some(log_manager) = self.active_log_manager() {
                let mut record = LogRecord::new_update(
                    txn.id(),
                    txn.prev_lsn(),
                    rid,
                    old.clone(),
                    new_tuple.clone(),
                );
                let lsn = log_manager.append_log_record(&mut record)?;
                txn.set_prev_lsn(lsn);
                page.set_lsn(lsn);
            }
            old
        };
        self.buffer_pool.unpin_page(rid.page_id, true)?;

        txn.push_write_record(WriteRecord::new(WriteOp::Update, rid, old));
        Ok(())
    }

    /// Mark the tuple at `rid` deleted. The physical delete happens at
    /// commit; abort rolls the mark back.
    pub fn mark_delete(&self, txn: &Transaction, rid: Rid) -> Result<()> {
        self.ensure_active(txn)?;
        let page_ptr = self.buffer_pool.fetch_page(rid.page_id)?;
        let old = {
            let mut page = page_ptr.write();
            let old = TablePage::get_tuple(&page, rid)?;
            TablePage::mark_delete(&mut page, rid)?;
            if let Some(log_manager) = self.active_log_manager() {
                let mut record =
                    LogRecord::new_mark_delete(txn.id(), txn.prev_lsn(), rid, old.clone());
                let lsn = log_manager.append_log_record(&mut record)?;
                txn.set_prev_lsn(lsn);
                page.set_lsn(lsn);
            }
            old
        };
        self.buffer_pool.unpin_page(rid.page_id, true)?;

        txn.push_write_record(WriteRecord::new(WriteOp::MarkDelete, rid, old));
        Ok(())
    }

    /// Commit: apply deferred deletes, make the COMMIT record durable
    /// (group commit), then release all locks
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        txn.set_state(TransactionState::Committed);

        // True delete happens only once the transaction is past the point
        // of rollback
        let write_set = txn.take_write_set();
        for record in &write_set {
            if record.op == WriteOp::MarkDelete {
                self.apply_delete(record.rid)?;
            }
        }

        if let Some(log_manager) = self.active_log_manager() {
            let mut record = LogRecord::new_commit(txn.id(), txn.prev_lsn());
            let commit_lsn = log_manager.append_log_record(&mut record)?;
            txn.set_prev_lsn(commit_lsn);

            // Group commit: block until the flush worker reports the
            // COMMIT record durable
            loop {
                let waiter = log_manager.add_commit_waiter(txn.id());
                let persistent = waiter.wait();
                if persistent >= commit_lsn {
                    break;
                }
            }
            debug!("txn {} committed at lsn {}", txn.id(), commit_lsn);
        }

        self.release_locks(txn);
        Ok(())
    }

    /// Abort: roll the write set back in reverse order, log ABORT, and
    /// release all locks
    pub fn abort(&self, txn: &Transaction) -> Result<()> {
        txn.set_state(TransactionState::Aborted);

        let write_set = txn.take_write_set();
        for record in write_set.iter().rev() {
            match record.op {
                WriteOp::Insert => self.apply_delete(record.rid)?,
                WriteOp::MarkDelete => self.rollback_delete(record.rid)?,
                WriteOp::Update => self.restore_tuple(record.rid, &record.old_tuple)?,
            }
        }

        if let Some(log_manager) = self.active_log_manager() {
            let mut record = LogRecord::new_abort(txn.id(), txn.prev_lsn());
            let lsn = log_manager.append_log_record(&mut record)?;
            txn.set_prev_lsn(lsn);
        }

        self.release_locks(txn);
        Ok(())
    }

    fn release_locks(&self, txn: &Transaction) {
        for rid in txn.locked_rids() {
            self.lock_manager.unlock(txn, rid);
        }
    }

    fn apply_delete(&self, rid: Rid) -> Result<()> {
        let page_ptr = self.buffer_pool.fetch_page(rid.page_id)?;
        {
            let mut page = page_ptr.write();
            TablePage::apply_delete(&mut page, rid)?;
        }
        self.buffer_pool.unpin_page(rid.page_id, true)?;
        Ok(())
    }

    fn rollback_delete(&self, rid: Rid) -> Result<()> {
        let page_ptr = self.buffer_pool.fetch_page(rid.page_id)?;
        {
            let mut page = page_ptr.write();
            TablePage::rollback_delete(&mut page, rid)?;
        }
        self.buffer_pool.unpin_page(rid.page_id, true)?;
        Ok(())
    }

    fn restore_tuple(&self, rid: Rid, old_tuple: &Tuple) -> Result<()> {
        let page_ptr = self.buffer_pool.fetch_page(rid.page_id)?;
        {
            let mut page = page_ptr.write();
            TablePage::update_tuple(&mut page, rid, old_tuple)?;
        }
        self.buffer_pool.unpin_page(rid.page_id, true)?;
        Ok(())
    }

    fn ensure_active(&self, txn: &Transaction) -> Result<()> {
        match txn.state() {
            TransactionState::Growing | TransactionState::Shrinking => Ok(()),
            _ => Err(TransactionError::NotActive(txn.id())),
        }
    }

    fn active_log_manager(&self) -> Option<&Arc<LogManager>> {
        self.log_manager
            .as_ref()
            .filter(|log_manager| log_manager.logging_enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;
    use tempfile::NamedTempFile;

    fn test_manager() -> (TransactionManager, Arc<BufferPoolManager>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let buffer_pool = Arc::new(BufferPoolManager::new(8, file.path()).unwrap());
        let manager = TransactionManager::new(
            Arc::clone(&buffer_pool),
            Arc::new(LockManager::new()),
            None,
        );
        (manager, buffer_pool, file)
    }

    #[test]
    fn test_begin_assigns_monotonic_ids() {
        let (manager, _pool, _file) = test_manager();
        let t0 = manager.begin().unwrap();
        let t1 = manager.begin().unwrap();
        assert!(t1.id() > t0.id());
    }

    #[test]
    fn test_abort_rolls_back_insert() {
        let (manager, pool, _file) = test_manager();
        let txn = manager.begin().unwrap();

        let (_, page_id) = manager.new_table_page(&txn, INVALID_PAGE_ID).unwrap();
        pool.unpin_page(page_id, true).unwrap();

        let rid = manager
            .insert_tuple(&txn, page_id, &Tuple::new(vec![1, 2, 3]))
            .unwrap();
        manager.abort(&txn).unwrap();

        let page = pool.fetch_page(page_id).unwrap();
        assert!(TablePage::get_tuple(&page.read(), rid).is_err());
        pool.unpin_page(page_id, false).unwrap();
    }

    #[test]
    fn test_abort_restores_update() {
        let (manager, pool, _file) = test_manager();
        let txn = manager.begin().unwrap();

        let (_, page_id) = manager.new_table_page(&txn, INVALID_PAGE_ID).unwrap();
        pool.unpin_page(page_id, true).unwrap();
        let rid = manager
            .insert_tuple(&txn, page_id, &Tuple::new(vec![1, 2, 3]))
            .unwrap();
        manager.commit(&txn).unwrap();

        let txn2 = manager.begin().unwrap();
        manager
            .update_tuple(&txn2, rid, &Tuple::new(vec![9, 9]))
            .unwrap();
        manager.abort(&txn2).unwrap();

        let page = pool.fetch_page(page_id).unwrap();
        assert_eq!(
            TablePage::get_tuple(&page.read(), rid).unwrap(),
            Tuple::new(vec![1, 2, 3])
        );
        pool.unpin_page(page_id, false).unwrap();
    }

    #[test]
    fn test_commit_applies_deferred_delete() {
        let (manager, pool, _file) = test_manager();
        let txn = manager.begin().unwrap();

        let (_, page_id) = manager.new_table_page(&txn, INVALID_PAGE_ID).unwrap();
        pool.unpin_page(page_id, true).unwrap();
        let rid = manager
            .insert_tuple(&txn, page_id, &Tuple::new(vec![5; 8]))
            .unwrap();
        manager.commit(&txn).unwrap();

        let txn2 = manager.begin().unwrap();
        manager.mark_delete(&txn2, rid).unwrap();
        manager.commit(&txn2).unwrap();

        let page = pool.fetch_page(page_id).unwrap();
        assert!(TablePage::get_tuple(&page.read(), rid).is_err());
        pool.unpin_page(page_id, false).unwrap();
    }

    #[test]
    fn test_abort_rolls_back_mark_delete() {
        let (manager, pool, _file) = test_manager();
        let txn = manager.begin().unwrap();

        let (_, page_id) = manager.new_table_page(&txn, INVALID_PAGE_ID).unwrap();
        pool.unpin_page(page_id, true).unwrap();
        let rid = manager
            .insert_tuple(&txn, page_id, &Tuple::new(vec![7; 4]))
            .unwrap();
        manager.commit(&txn).unwrap();

        let txn2 = manager.begin().unwrap();
        manager.mark_delete(&txn2, rid).unwrap();
        manager.abort(&txn2).unwrap();

        let page = pool.fetch_page(page_id).unwrap();
        assert_eq!(
            TablePage::get_tuple(&page.read(), rid).unwrap(),
            Tuple::new(vec![7; 4])
        );
        pool.unpin_page(page_id, false).unwrap();
    }
}
