use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{Transaction, TransactionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A granted lock. Waiters are not queued here; they block on the rid's
/// condition variable and re-examine the live queue on every wake.
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
}

struct RidQueue {
    granted: Vec<LockRequest>,
    cv: Arc<Condvar>,
}

impl RidQueue {
    fn new() -> Self {
        Self {
            granted: Vec::new(),
            cv: Arc::new(Condvar::new()),
        }
    }

    fn holds(&self, txn_id: TxnId) -> bool {
        self.granted.iter().any(|r| r.txn_id == txn_id)
    }
}

struct LockTable {
    table: HashMap<Rid, RidQueue>,
    /// Wait-die ordering stamps, assigned at a transaction's first lock
    /// request and discarded with its last unlock
    stamps: HashMap<TxnId, u64>,
    next_stamp: u64,
}

/// Tuple-level lock manager implementing two-phase locking with wait-die
/// deadlock prevention.
///
/// A single mutex guards the whole lock table; each rid carries a
/// condition variable for its waiters. Because a transaction only ever
/// blocks on holders younger than itself, the wait-for graph is acyclic.
pub struct LockManager {
    strict: bool,
    inner: Mutex<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_strict_2pl(false)
    }

    /// In strict mode, unlocking before the transaction reaches a
    /// terminal state aborts it
    pub fn with_strict_2pl(strict: bool) -> Self {
        Self {
            strict,
            inner: Mutex::new(LockTable {
                table: HashMap::new(),
                stamps: HashMap::new(),
                next_stamp: 0,
            }),
        }
    }

    /// Acquire a shared lock on `rid`. Returns false (with the
    /// transaction marked aborted) when wait-die chooses this requester
    /// as the victim.
    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> bool {
        assert_eq!(txn.state(), TransactionState::Growing);

        let mut guard = self.inner.lock();
        let my_stamp = Self::stamp_of(&mut guard, txn.id());

        loop {
            let table = &mut *guard;
            let entry = table.table.entry(rid).or_insert_with(RidQueue::new);

            // Grantable: no exclusive holder
            if entry.granted.iter().all(|r| r.mode == LockMode::Shared) {
                entry.granted.push(LockRequest {
                    txn_id: txn.id(),
                    mode: LockMode::Shared,
                });
                txn.add_shared_lock(rid);
                txn.assert_lock_sets_disjoint(rid);
                return true;
            }

            // Conflict: die rather than wait on an older exclusive holder
            let stamps = &table.stamps;
            let blocked_by_older = entry
                .granted
                .iter()
                .filter(|r| r.mode == LockMode::Exclusive)
                .any(|r| stamps[&r.txn_id] < my_stamp);
            if blocked_by_older {
                Self::die(&mut guard, txn);
                return false;
            }

            let cv = Arc::clone(&entry.cv);
            cv.wait(&mut guard);
        }
    }

    /// Acquire an exclusive lock on `rid`
    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> bool {
        assert_eq!(txn.state(), TransactionState::Growing);

        let mut guard = self.inner.lock();
        let my_stamp = Self::stamp_of(&mut guard, txn.id());

        loop {
            let table = &mut *guard;
            let entry = table.table.entry(rid).or_insert_with(RidQueue::new);

            if entry.granted.is_empty() {
                entry.granted.push(LockRequest {
                    txn_id: txn.id(),
                    mode: LockMode::Exclusive,
                });
                txn.add_exclusive_lock(rid);
                txn.assert_lock_sets_disjoint(rid);
                return true;
            }

            // Exclusive conflicts with every holder
            let stamps = &table.stamps;
            let blocked_by_older = entry
                .granted
                .iter()
                .any(|r| stamps[&r.txn_id] < my_stamp);
            if blocked_by_older {
                Self::die(&mut guard, txn);
                return false;
            }

            let cv = Arc::clone(&entry.cv);
            cv.wait(&mut guard);
        }
    }

    /// Upgrade an already-held shared lock to exclusive. Waits until this
    /// transaction's shared entry is the only one left on the rid.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> bool {
        assert_eq!(txn.state(), TransactionState::Growing);
        assert!(txn.holds_shared(rid), "upgrade without a shared lock");

        let mut guard = self.inner.lock();
        let my_stamp = Self::stamp_of(&mut guard, txn.id());

        loop {
            let table = &mut *guard;
            let entry = table
                .table
                .get_mut(&rid)
                .expect("held shared lock must have a queue entry");
            debug_assert!(entry.holds(txn.id()));

            if entry.granted.len() == 1 && entry.granted[0].txn_id == txn.id() {
                entry.granted[0].mode = LockMode::Exclusive;
                txn.remove_shared_lock(rid);
                txn.add_exclusive_lock(rid);
                txn.assert_lock_sets_disjoint(rid);
                return true;
            }

            let stamps = &table.stamps;
            let my_id = txn.id();
            let blocked_by_older = entry
                .granted
                .iter()
                .filter(|r| r.txn_id != my_id)
                .any(|r| stamps[&r.txn_id] < my_stamp);
            if blocked_by_older {
                // Our shared entry stays behind; the abort path releases it
                Self::die(&mut guard, txn);
                return false;
            }

            let cv = Arc::clone(&entry.cv);
            cv.wait(&mut guard);
        }
    }

    /// Release `rid`. Outside strict mode the first unlock moves the
    /// transaction to its shrinking phase; in strict mode an unlock
    /// before commit/abort aborts the transaction and releases nothing.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        let state = txn.state();
        if self.strict
            && state != TransactionState::Committed
            && state != TransactionState::Aborted
        {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        if !self.strict && state == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }

        txn.assert_lock_sets_disjoint(rid);
        txn.remove_shared_lock(rid);
        txn.remove_exclusive_lock(rid);

        let mut guard = self.inner.lock();
        if let Some(entry) = guard.table.get_mut(&rid) {
            if let Some(pos) = entry.granted.iter().position(|r| r.txn_id == txn.id()) {
                entry.granted.remove(pos);
            }
            entry.cv.notify_all();
            if entry.granted.is_empty() {
                guard.table.remove(&rid);
            }
        }
        if txn.holds_no_locks() {
            guard.stamps.remove(&txn.id());
        }

        true
    }

    /// Wait-die stamp for `txn_id`, assigned on first use
    fn stamp_of(table: &mut LockTable, txn_id: TxnId) -> u64 {
        if let Some(&stamp) = table.stamps.get(&txn_id) {
            return stamp;
        }
        let stamp = table.next_stamp;
        table.next_stamp += 1;
        table.stamps.insert(txn_id, stamp);
        stamp
    }

    /// The requester dies rather than waiting on an older holder
    fn die(table: &mut LockTable, txn: &Transaction) {
        txn.set_state(TransactionState::Aborted);
        if txn.holds_no_locks() {
            table.stamps.remove(&txn.id());
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_shared(&t1, rid));
        assert!(lm.lock_shared(&t2, rid));
        assert!(t1.holds_shared(rid));
        assert!(t2.holds_shared(rid));

        assert!(lm.unlock(&t1, rid));
        assert!(lm.unlock(&t2, rid));
    }

    #[test]
    fn test_younger_requester_dies() {
        let lm = LockManager::new();
        let older = Transaction::new(1);
        let younger = Transaction::new(2);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_exclusive(&older, rid));
        assert!(!lm.lock_shared(&younger, rid));
        assert_eq!(younger.state(), TransactionState::Aborted);

        assert!(lm.unlock(&older, rid));
    }

    #[test]
    fn test_older_requester_waits() {
        let lm = Arc::new(LockManager::new());
        let rid = Rid::new(1, 0);

        // The younger transaction must take its stamp after the older one
        let older = Arc::new(Transaction::new(1));
        let younger = Arc::new(Transaction::new(2));
        assert!(lm.lock_shared(&older, Rid::new(9, 9)));
        assert!(lm.lock_exclusive(&younger, rid));

        let lm2 = Arc::clone(&lm);
        let older2 = Arc::clone(&older);
        let waiter = thread::spawn(move || lm2.lock_shared(&older2, rid));

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        younger.set_state(TransactionState::Committed);
        assert!(lm.unlock(&younger, rid));
        assert!(waiter.join().unwrap());
        assert!(older.holds_shared(rid));
    }

    #[test]
    fn test_unlock_moves_to_shrinking() {
        let lm = LockManager::new();
        let txn = Transaction::new(1);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_shared(&txn, rid));
        assert!(lm.unlock(&txn, rid));
        assert_eq!(txn.state(), TransactionState::Shrinking);
    }

    #[test]
    fn test_strict_mode_aborts_early_unlock() {
        let lm = LockManager::with_strict_2pl(true);
        let txn = Transaction::new(1);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_exclusive(&txn, rid));
        assert!(!lm.unlock(&txn, rid));
        assert_eq!(txn.state(), TransactionState::Aborted);

        // After the abort is acknowledged the release goes through
        assert!(lm.unlock(&txn, rid));
        assert!(txn.holds_no_locks());
    }

    #[test]
    fn test_upgrade_when_sole_holder() {
        let lm = LockManager::new();
        let txn = Transaction::new(1);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_shared(&txn, rid));
        assert!(lm.lock_upgrade(&txn, rid));
        assert!(txn.holds_exclusive(rid));
        assert!(!txn.holds_shared(rid));

        assert!(lm.unlock(&txn, rid));
    }

    #[test]
    fn test_upgrade_waits_for_other_readers() {
        let lm = Arc::new(LockManager::new());
        let rid = Rid::new(1, 0);

        let older = Arc::new(Transaction::new(1));
        let younger = Arc::new(Transaction::new(2));
        assert!(lm.lock_shared(&older, rid));
        assert!(lm.lock_shared(&younger, rid));

        let lm2 = Arc::clone(&lm);
        let older2 = Arc::clone(&older);
        let upgrader = thread::spawn(move || lm2.lock_upgrade(&older2, rid));

        thread::sleep(Duration::from_millis(50));
        assert!(!upgrader.is_finished());

        younger.set_state(TransactionState::Committed);
        assert!(lm.unlock(&younger, rid));
        assert!(upgrader.join().unwrap());
        assert!(older.holds_exclusive(rid));
    }

    #[test]
    fn test_exclusive_blocks_until_release() {
        let lm = Arc::new(LockManager::new());
        let rid = Rid::new(2, 1);

        let older = Arc::new(Transaction::new(1));
        let younger = Arc::new(Transaction::new(2));
        assert!(lm.lock_shared(&older, Rid::new(8, 8)));
        assert!(lm.lock_shared(&younger, rid));

        let lm2 = Arc::clone(&lm);
        let older2 = Arc::clone(&older);
        let writer = thread::spawn(move || lm2.lock_exclusive(&older2, rid));

        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        younger.set_state(TransactionState::Committed);
        assert!(lm.unlock(&younger, rid));
        assert!(writer.join().unwrap());
        assert!(older.holds_exclusive(rid));
    }
}
