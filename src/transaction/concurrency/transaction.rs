use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{PageId, Rid, TxnId};
use crate::storage::buffer::PageGuard;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why a transaction was aborted by the lock manager
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("shared lock requested under READ_UNCOMMITTED")]
    LockSharedOnReadUncommitted,

    #[error("lock requested while shrinking")]
    LockOnShrinking,

    #[error("deadlock")]
    Deadlock,

    #[error("another transaction is already upgrading")]
    UpgradeConflict,
}

#[derive(Error, Debug)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbortError {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

/// An active transaction.
///
/// The lock manager is the only writer of the lock sets and of
/// deadlock-abort state transitions; the B+Tree parks its latch-crabbing
/// page guards in the page set and records structurally deleted pages in the
/// deleted page set.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    page_set: Mutex<VecDeque<PageGuard>>,
    deleted_page_set: Mutex<HashSet<PageId>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            page_set: Mutex::new(VecDeque::new()),
            deleted_page_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    // ---- lock sets (written by the lock manager) ----

    pub fn is_shared_locked(&self, rid: &Rid) -> bool {
        self.shared_lock_set.lock().contains(rid)
    }

    pub fn is_exclusive_locked(&self, rid: &Rid) -> bool {
        self.exclusive_lock_set.lock().contains(rid)
    }

    pub(crate) fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_shared_lock(&self, rid: &Rid) {
        self.shared_lock_set.lock().remove(rid);
    }

    pub(crate) fn remove_exclusive_lock(&self, rid: &Rid) {
        self.exclusive_lock_set.lock().remove(rid);
    }

    /// Snapshot of every rid this transaction currently holds a lock on.
    pub fn locked_rids(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }

    // ---- latch crabbing page set ----

    pub fn add_into_page_set(&self, guard: PageGuard) {
        self.page_set.lock().push_back(guard);
    }

    pub fn pop_page_front(&self) -> Option<PageGuard> {
        self.page_set.lock().pop_front()
    }

    pub fn pop_page_back(&self) -> Option<PageGuard> {
        self.page_set.lock().pop_back()
    }

    pub fn front_page_id(&self) -> Option<PageId> {
        self.page_set.lock().front().map(|guard| guard.page_id())
    }

    pub fn page_set_len(&self) -> usize {
        self.page_set.lock().len()
    }

    /// Drop every held guard, releasing latches and pins front-first.
    pub fn release_all_pages(&self) {
        let mut pages = self.page_set.lock();
        while pages.pop_front().is_some() {}
    }

    pub fn add_into_deleted_page_set(&self, page_id: PageId) {
        self.deleted_page_set.lock().insert(page_id);
    }

    pub fn take_deleted_pages(&self) -> HashSet<PageId> {
        std::mem::take(&mut *self.deleted_page_set.lock())
    }
}
