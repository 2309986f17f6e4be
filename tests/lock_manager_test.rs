use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod common;
use common::init_test_logging;

use keeldb::common::types::Rid;
use keeldb::transaction::concurrency::{
    AbortReason, IsolationLevel, LockManagerConfig, TransactionState,
};
use keeldb::{LockManager, TransactionManager};

fn setup() -> (Arc<TransactionManager>, LockManager) {
    init_test_logging();
    let txn_manager = Arc::new(TransactionManager::new());
    let lock_manager = LockManager::new(LockManagerConfig::default(), Arc::clone(&txn_manager));
    (txn_manager, lock_manager)
}

fn fast_setup(interval_ms: u64) -> (Arc<TransactionManager>, Arc<LockManager>) {
    init_test_logging();
    let txn_manager = Arc::new(TransactionManager::new());
    let lock_manager = Arc::new(LockManager::new(
        LockManagerConfig {
            cycle_detection_interval: Duration::from_millis(interval_ms),
        },
        Arc::clone(&txn_manager),
    ));
    (txn_manager, lock_manager)
}

#[test]
fn test_shared_lock_basic() {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 1);

    lock_manager.lock_shared(&t1, rid).unwrap();
    lock_manager.lock_shared(&t2, rid).unwrap();
    assert!(t1.is_shared_locked(&rid));
    assert!(t2.is_shared_locked(&rid));

    assert!(lock_manager.unlock(&t1, &rid));
    assert!(lock_manager.unlock(&t2, &rid));
    assert!(!t1.is_shared_locked(&rid));
}

#[test]
fn test_read_uncommitted_rejects_shared() {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::ReadUncommitted);
    let rid = Rid::new(1, 1);

    let err = lock_manager.lock_shared(&t1, rid).unwrap_err();
    assert_eq!(err.reason, AbortReason::LockSharedOnReadUncommitted);
    assert_eq!(t1.state(), TransactionState::Aborted);
}

#[test]
fn test_read_uncommitted_allows_exclusive() {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::ReadUncommitted);
    let rid = Rid::new(1, 1);

    lock_manager.lock_exclusive(&t1, rid).unwrap();
    assert!(t1.is_exclusive_locked(&rid));
    assert!(lock_manager.unlock(&t1, &rid));
}

#[test]
fn test_repeatable_read_lock_on_shrinking() {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid_a = Rid::new(1, 1);
    let rid_b = Rid::new(1, 2);

    lock_manager.lock_shared(&t1, rid_a).unwrap();
    assert!(lock_manager.unlock(&t1, &rid_a));
    assert_eq!(t1.state(), TransactionState::Shrinking);

    let err = lock_manager.lock_shared(&t1, rid_b).unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);
}

#[test]
fn test_read_committed_shared_after_unlock() {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::ReadCommitted);
    let rid_a = Rid::new(1, 1);
    let rid_b = Rid::new(1, 2);

    // Releasing a shared lock does not start shrinking under READ_COMMITTED.
    lock_manager.lock_shared(&t1, rid_a).unwrap();
    assert!(lock_manager.unlock(&t1, &rid_a));
    assert_eq!(t1.state(), TransactionState::Growing);
    lock_manager.lock_shared(&t1, rid_b).unwrap();

    // Releasing an exclusive lock does.
    lock_manager.lock_exclusive(&t1, rid_a).unwrap();
    assert!(lock_manager.unlock(&t1, &rid_a));
    assert_eq!(t1.state(), TransactionState::Shrinking);
}

#[test]
fn test_relock_is_a_programming_error() {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 1);

    lock_manager.lock_shared(&t1, rid).unwrap();
    let err = lock_manager.lock_shared(&t1, rid).unwrap_err();
    assert_eq!(err.reason, AbortReason::Deadlock);
}

#[test]
fn test_shared_blocks_behind_exclusive_until_unlock() {
    let (txn_manager, lock_manager) = fast_setup(50);
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(2, 7);

    lock_manager.lock_exclusive(&t1, rid).unwrap();

    let granted = Arc::new(AtomicBool::new(false));
    let waiter = {
        let lock_manager = Arc::clone(&lock_manager);
        let granted = Arc::clone(&granted);
        let t2 = Arc::clone(&t2);
        thread::spawn(move || {
            lock_manager.lock_shared(&t2, rid).unwrap();
            granted.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!granted.load(Ordering::SeqCst), "S granted under live X lock");
    assert!(lock_manager
        .wait_for_edges()
        .contains(&(t2.id(), t1.id())));

    assert!(lock_manager.unlock(&t1, &rid));
    waiter.join().unwrap();
    assert!(granted.load(Ordering::SeqCst));
    assert!(t2.is_shared_locked(&rid));
}

#[test]
fn test_fifo_shared_does_not_jump_queued_exclusive() {
    let (txn_manager, lock_manager) = fast_setup(50);
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t3 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(3, 3);

    lock_manager.lock_shared(&t1, rid).unwrap();

    let x_granted = Arc::new(AtomicBool::new(false));
    let x_waiter = {
        let lock_manager = Arc::clone(&lock_manager);
        let x_granted = Arc::clone(&x_granted);
        let t2 = Arc::clone(&t2);
        thread::spawn(move || {
            lock_manager.lock_exclusive(&t2, rid).unwrap();
            x_granted.store(true, Ordering::SeqCst);
        })
    };
    // Give T2 time to queue behind T1's shared lock.
    thread::sleep(Duration::from_millis(100));
    assert!(!x_granted.load(Ordering::SeqCst));

    let s_granted = Arc::new(AtomicBool::new(false));
    let s_waiter = {
        let lock_manager = Arc::clone(&lock_manager);
        let s_granted = Arc::clone(&s_granted);
        let t3 = Arc::clone(&t3);
        thread::spawn(move || {
            lock_manager.lock_shared(&t3, rid).unwrap();
            s_granted.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    // S3 arrived after X2 and must not be granted ahead of it.
    assert!(!s_granted.load(Ordering::SeqCst), "S3 jumped the queue");

    assert!(lock_manager.unlock(&t1, &rid));
    x_waiter.join().unwrap();
    assert!(x_granted.load(Ordering::SeqCst));

    assert!(lock_manager.unlock(&t2, &rid));
    s_waiter.join().unwrap();
    assert!(s_granted.load(Ordering::SeqCst));
    assert!(lock_manager.unlock(&t3, &rid));
}

#[test]
fn test_upgrade_shared_to_exclusive() {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(4, 4);

    lock_manager.lock_shared(&t1, rid).unwrap();
    assert!(lock_manager.lock_upgrade(&t1, rid).unwrap());
    assert!(!t1.is_shared_locked(&rid));
    assert!(t1.is_exclusive_locked(&rid));

    // Upgrades are possible again once the first one finished.
    assert!(lock_manager.unlock(&t1, &rid));
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager.lock_shared(&t2, rid).unwrap();
    assert!(lock_manager.lock_upgrade(&t2, rid).unwrap());
    assert!(lock_manager.unlock(&t2, &rid));
}

#[test]
fn test_upgrade_without_shared_lock_returns_false() {
    let (txn_manager, lock_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(4, 5);

    assert!(!lock_manager.lock_upgrade(&t1, rid).unwrap());
}

#[test]
fn test_concurrent_upgrades_conflict() {
    let (txn_manager, lock_manager) = fast_setup(50);
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(5, 5);

    lock_manager.lock_shared(&t1, rid).unwrap();
    lock_manager.lock_shared(&t2, rid).unwrap();

    // T1's upgrade waits on T2's shared lock; T2's upgrade attempt must
    // fail immediately with a conflict.
    let upgrader = {
        let lock_manager = Arc::clone(&lock_manager);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || lock_manager.lock_upgrade(&t1, rid))
    };
    thread::sleep(Duration::from_millis(100));

    let err = lock_manager.lock_upgrade(&t2, rid).unwrap_err();
    assert_eq!(err.reason, AbortReason::UpgradeConflict);
    assert_eq!(t2.state(), TransactionState::Aborted);

    // Aborting T2 releases its shared lock, letting T1's upgrade through.
    assert!(lock_manager.unlock(&t2, &rid));
    assert!(upgrader.join().unwrap().unwrap());
    assert!(t1.is_exclusive_locked(&rid));
}

#[test]
fn test_two_transaction_deadlock_aborts_younger() {
    let (txn_manager, lock_manager) = fast_setup(30);
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid_a = Rid::new(6, 1);
    let rid_b = Rid::new(6, 2);

    lock_manager.lock_exclusive(&t1, rid_a).unwrap();
    lock_manager.lock_exclusive(&t2, rid_b).unwrap();

    // T1 blocks on B; T2 then closes the cycle by asking for A. The
    // ascending-id DFS aborts the higher-id transaction.
    let older = {
        let lock_manager = Arc::clone(&lock_manager);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || lock_manager.lock_exclusive(&t1, rid_b))
    };
    thread::sleep(Duration::from_millis(50));

    let younger_result = lock_manager.lock_exclusive(&t2, rid_a);
    let err = younger_result.unwrap_err();
    assert_eq!(err.reason, AbortReason::Deadlock);
    assert_eq!(t2.state(), TransactionState::Aborted);

    // The survivor's request goes through once the victim's locks are gone.
    older.join().unwrap().unwrap();
    assert_eq!(t1.state(), TransactionState::Growing);
    assert!(t1.is_exclusive_locked(&rid_a));
    assert!(t1.is_exclusive_locked(&rid_b));

    assert!(lock_manager.unlock(&t1, &rid_a));
    assert!(lock_manager.unlock(&t1, &rid_b));
}

#[test]
fn test_mutual_exclusion_under_contention() {
    let (txn_manager, lock_manager) = fast_setup(100);
    let rid = Rid::new(9, 9);
    let in_critical = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let lock_manager = Arc::clone(&lock_manager);
        let txn_manager = Arc::clone(&txn_manager);
        let in_critical = Arc::clone(&in_critical);
        handles.push(thread::spawn(move || {
            // Unlocking starts the shrinking phase, so every round is its
            // own transaction.
            for _ in 0..50 {
                let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
                lock_manager.lock_exclusive(&txn, rid).unwrap();
                assert!(
                    !in_critical.swap(true, Ordering::SeqCst),
                    "two exclusive holders"
                );
                thread::sleep(Duration::from_micros(50));
                in_critical.store(false, Ordering::SeqCst);
                assert!(lock_manager.unlock(&txn, &rid));
                txn_manager.complete(txn.id());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
