use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use petradb::common::types::{Rid, Tuple, INVALID_PAGE_ID};
use petradb::transaction::concurrency::{LockManager, Transaction, TransactionState};
use petradb::transaction::TransactionManager;

mod common;
use common::create_test_buffer_pool;

#[test]
fn test_wait_die_death() -> Result<()> {
    let lock_manager = LockManager::new();
    let rid = Rid::new(1, 0);

    // The older transaction takes its stamp first and holds exclusively
    let t0 = Transaction::new(0);
    let t1 = Transaction::new(1);
    assert!(lock_manager.lock_exclusive(&t0, rid));

    // The younger requester dies instead of waiting
    assert!(!lock_manager.lock_shared(&t1, rid));
    assert_eq!(t1.state(), TransactionState::Aborted);
    assert!(t1.holds_no_locks());

    assert!(lock_manager.unlock(&t0, rid));
    Ok(())
}

#[test]
fn test_older_transaction_waits_for_younger() -> Result<()> {
    let lock_manager = Arc::new(LockManager::new());
    let rid = Rid::new(1, 0);

    let older = Arc::new(Transaction::new(0));
    let younger = Arc::new(Transaction::new(1));

    // Stamp order: older first
    assert!(lock_manager.lock_shared(&older, Rid::new(5, 5)));
    assert!(lock_manager.lock_exclusive(&younger, rid));

    let lm = Arc::clone(&lock_manager);
    let waiting = Arc::clone(&older);
    let handle = thread::spawn(move || lm.lock_shared(&waiting, rid));

    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished(), "older requester must wait, not die");

    younger.set_state(TransactionState::Committed);
    assert!(lock_manager.unlock(&younger, rid));
    assert!(handle.join().unwrap());
    assert!(older.holds_shared(rid));
    Ok(())
}

#[test]
fn test_wait_die_victim_aborts_cleanly() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(8)?;
    let lock_manager = Arc::new(LockManager::new());
    let manager =
        TransactionManager::new(Arc::clone(&buffer_pool), Arc::clone(&lock_manager), None);

    let older = manager.begin()?;
    let younger = manager.begin()?;

    let (_, page_id) = manager.new_table_page(&older, INVALID_PAGE_ID)?;
    buffer_pool.unpin_page(page_id, true)?;
    let rid = manager.insert_tuple(&older, page_id, &Tuple::new(vec![1]))?;

    assert!(lock_manager.lock_exclusive(&older, rid));
    assert!(!lock_manager.lock_shared(&younger, rid));
    assert_eq!(younger.state(), TransactionState::Aborted);

    // The caller observes the failed lock and aborts the victim
    manager.abort(&younger)?;
    manager.commit(&older)?;
    assert!(older.holds_no_locks());
    Ok(())
}

#[test]
fn test_shared_then_upgrade_serializes_writers() -> Result<()> {
    let lock_manager = Arc::new(LockManager::new());
    let rid = Rid::new(3, 7);

    let t0 = Arc::new(Transaction::new(0));
    let t1 = Arc::new(Transaction::new(1));
    assert!(lock_manager.lock_shared(&t0, rid));
    assert!(lock_manager.lock_shared(&t1, rid));

    let lm = Arc::clone(&lock_manager);
    let upgrading = Arc::clone(&t0);
    let handle = thread::spawn(move || lm.lock_upgrade(&upgrading, rid));

    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_finished(), "upgrade must wait for the other reader");

    t1.set_state(TransactionState::Committed);
    assert!(lock_manager.unlock(&t1, rid));
    assert!(handle.join().unwrap());
    assert!(t0.holds_exclusive(rid));
    assert!(lock_manager.unlock(&t0, rid));
    Ok(())
}

#[test]
fn test_strict_2pl_refuses_early_unlock() -> Result<()> {
    let lock_manager = LockManager::with_strict_2pl(true);
    let txn = Transaction::new(0);
    let rid = Rid::new(2, 2);

    assert!(lock_manager.lock_exclusive(&txn, rid));
    assert!(!lock_manager.unlock(&txn, rid));
    assert_eq!(txn.state(), TransactionState::Aborted);
    Ok(())
}

#[test]
fn test_locks_released_after_commit_allow_new_access() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(8)?;
    let lock_manager = Arc::new(LockManager::new());
    let manager =
        TransactionManager::new(Arc::clone(&buffer_pool), Arc::clone(&lock_manager), None);

    let writer = manager.begin()?;
    let (_, page_id) = manager.new_table_page(&writer, INVALID_PAGE_ID)?;
    buffer_pool.unpin_page(page_id, true)?;
    let rid = manager.insert_tuple(&writer, page_id, &Tuple::new(vec![9]))?;
    assert!(lock_manager.lock_exclusive(&writer, rid));
    manager.commit(&writer)?;

    // A later (younger) transaction can lock the rid immediately
    let reader = manager.begin()?;
    assert!(lock_manager.lock_shared(&reader, rid));
    manager.commit(&reader)?;
    Ok(())
}
