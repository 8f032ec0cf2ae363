use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;

use crate::common::types::{Lsn, Rid, Tuple, TxnId, INVALID_LSN};

/// Two-phase locking states plus the terminal outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// The table mutation a write record undoes or completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    MarkDelete,
    Update,
}

/// One entry of a transaction's write set. `old_tuple` carries the
/// before-image for updates and is empty otherwise.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub op: WriteOp,
    pub rid: Rid,
    pub old_tuple: Tuple,
}

impl WriteRecord {
    pub fn new(op: WriteOp, rid: Rid, old_tuple: Tuple) -> Self {
        Self { op, rid, old_tuple }
    }
}

/// An active transaction. The owning thread drives it, but state and the
/// lock sets sit behind interior mutability so the lock manager can mark
/// a wait-die victim aborted through a shared reference.
pub struct Transaction {
    id: TxnId,
    state: Mutex<TransactionState>,
    prev_lsn: AtomicI32,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    write_set: Mutex<Vec<WriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Growing),
            prev_lsn: AtomicI32::new(INVALID_LSN),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// LSN of this transaction's most recent log record
    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn.load(Ordering::SeqCst)
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        self.prev_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn holds_shared(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn holds_exclusive(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    pub fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub fn remove_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().remove(&rid);
    }

    pub fn remove_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().remove(&rid);
    }

    /// Every rid this transaction currently holds a lock on
    pub fn locked_rids(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }

    pub fn holds_no_locks(&self) -> bool {
        self.shared_lock_set.lock().is_empty() && self.exclusive_lock_set.lock().is_empty()
    }

    pub fn push_write_record(&self, record: WriteRecord) {
        self.write_set.lock().push(record);
    }

    /// Drain the write set, leaving it empty
    pub fn take_write_set(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut *self.write_set.lock())
    }

    /// A rid must never sit in both lock sets
    pub fn assert_lock_sets_disjoint(&self, rid: Rid) {
        debug_assert!(
            !(self.holds_shared(rid) && self.holds_exclusive(rid)),
            "txn {} holds rid {:?} in both lock sets",
            self.id,
            rid
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_state() {
        let txn = Transaction::new(1);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.prev_lsn(), INVALID_LSN);
        assert!(txn.holds_no_locks());
    }

    #[test]
    fn test_lock_set_tracking() {
        let txn = Transaction::new(2);
        let rid = Rid::new(1, 0);

        txn.add_shared_lock(rid);
        assert!(txn.holds_shared(rid));
        assert!(!txn.holds_exclusive(rid));

        txn.remove_shared_lock(rid);
        txn.add_exclusive_lock(rid);
        assert!(txn.holds_exclusive(rid));
        assert_eq!(txn.locked_rids(), vec![rid]);
    }

    #[test]
    fn test_write_set_drain() {
        let txn = Transaction::new(3);
        txn.push_write_record(WriteRecord::new(WriteOp::Insert, Rid::new(1, 0), Tuple::default()));
        txn.push_write_record(WriteRecord::new(WriteOp::MarkDelete, Rid::new(1, 1), Tuple::default()));

        let drained = txn.take_write_set();
        assert_eq!(drained.len(), 2);
        assert!(txn.take_write_set().is_empty());
    }
}
