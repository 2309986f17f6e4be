use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionAbortError, TransactionState,
};
use crate::transaction::concurrency::transaction_manager::TransactionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

struct LockQueue {
    requests: VecDeque<LockRequest>,
    upgrading: Option<TxnId>,
    cv: Arc<Condvar>,
}

impl LockQueue {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            upgrading: None,
            cv: Arc::new(Condvar::new()),
        }
    }
}

type LockTable = HashMap<Rid, LockQueue>;

pub struct LockManagerConfig {
    /// How often the background detector scans for wait-for cycles.
    pub cycle_detection_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            cycle_detection_interval: Duration::from_millis(50),
        }
    }
}

struct Shared {
    latch: Mutex<LockTable>,
    txn_manager: Arc<TransactionManager>,
    running: AtomicBool,
}

/// Row-granularity lock manager.
///
/// Per-rid FIFO request queues with shared/exclusive modes under the 2PL
/// variants of the three isolation levels. A background thread rebuilds the
/// wait-for graph every `cycle_detection_interval` and aborts the
/// transaction at which the first back-edge closes, under a deterministic
/// ascending-id DFS.
pub struct LockManager {
    shared: Arc<Shared>,
    detector: Option<JoinHandle<()>>,
}

impl LockManager {
    pub fn new(config: LockManagerConfig, txn_manager: Arc<TransactionManager>) -> Self {
        let shared = Arc::new(Shared {
            latch: Mutex::new(HashMap::new()),
            txn_manager,
            running: AtomicBool::new(true),
        });

        let detector_shared = Arc::clone(&shared);
        let interval = config.cycle_detection_interval;
        let detector = thread::Builder::new()
            .name("deadlock-detector".into())
            .spawn(move || Self::run_cycle_detection(detector_shared, interval))
            .expect("failed to spawn deadlock detector thread");

        Self {
            shared,
            detector: Some(detector),
        }
    }

    /// Acquire a shared lock on `rid`, blocking until no earlier exclusive
    /// request precedes ours in the queue.
    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> Result<(), TransactionAbortError> {
        let mut table = self.shared.latch.lock();

        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            return Err(Self::abort(txn, AbortReason::LockSharedOnReadUncommitted));
        }
        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() != TransactionState::Growing
        {
            return Err(Self::abort(txn, AbortReason::LockOnShrinking));
        }
        if txn.is_shared_locked(&rid) || txn.is_exclusive_locked(&rid) {
            return Err(Self::abort(txn, AbortReason::Deadlock));
        }

        txn.add_shared_lock(rid);
        let queue = table.entry(rid).or_insert_with(LockQueue::new);
        queue.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode: LockMode::Shared,
            granted: false,
        });
        let cv = Arc::clone(&queue.cv);

        loop {
            if txn.state() == TransactionState::Aborted {
                return Err(Self::abort(txn, AbortReason::Deadlock));
            }
            if Self::try_grant_shared(&mut table, txn.id(), &rid) {
                return Ok(());
            }
            cv.wait(&mut table);
        }
    }

    /// Acquire an exclusive lock on `rid`, blocking until our request heads
    /// the queue.
    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> Result<(), TransactionAbortError> {
        let mut table = self.shared.latch.lock();

        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() != TransactionState::Growing
        {
            return Err(Self::abort(txn, AbortReason::LockOnShrinking));
        }
        if txn.is_shared_locked(&rid) || txn.is_exclusive_locked(&rid) {
            return Err(Self::abort(txn, AbortReason::Deadlock));
        }

        txn.add_exclusive_lock(rid);
        let queue = table.entry(rid).or_insert_with(LockQueue::new);
        queue.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode: LockMode::Exclusive,
            granted: false,
        });
        let cv = Arc::clone(&queue.cv);

        loop {
            if txn.state() == TransactionState::Aborted {
                return Err(Self::abort(txn, AbortReason::Deadlock));
            }
            if Self::try_grant_exclusive(&mut table, txn.id(), &rid) {
                return Ok(());
            }
            cv.wait(&mut table);
        }
    }

    /// Upgrade a held shared lock to exclusive. Returns `Ok(false)` when the
    /// transaction does not hold a shared lock on `rid`. Only one upgrade
    /// may be in flight per rid; the loser aborts with `UpgradeConflict`.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> Result<bool, TransactionAbortError> {
        let mut table = self.shared.latch.lock();

        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            return Err(Self::abort(txn, AbortReason::LockSharedOnReadUncommitted));
        }
        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() != TransactionState::Growing
        {
            return Err(Self::abort(txn, AbortReason::LockOnShrinking));
        }
        if !table.contains_key(&rid) || !txn.is_shared_locked(&rid) {
            return Ok(false);
        }
        if txn.is_exclusive_locked(&rid) {
            return Err(Self::abort(txn, AbortReason::Deadlock));
        }

        let queue = match table.get_mut(&rid) {
            Some(queue) => queue,
            None => return Ok(false),
        };
        if queue.upgrading.is_some() {
            return Err(Self::abort(txn, AbortReason::UpgradeConflict));
        }
        queue.upgrading = Some(txn.id());

        txn.remove_shared_lock(&rid);
        txn.add_exclusive_lock(rid);

        // Swap the granted shared request for an ungranted exclusive one at
        // the tail, and wake the queue: dropping our shared grant may have
        // unblocked the current head.
        queue.requests.retain(|request| request.txn_id != txn.id());
        queue.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode: LockMode::Exclusive,
            granted: false,
        });
        let cv = Arc::clone(&queue.cv);
        cv.notify_all();

        loop {
            if txn.state() == TransactionState::Aborted {
                return Err(Self::abort(txn, AbortReason::Deadlock));
            }
            if Self::try_grant_exclusive(&mut table, txn.id(), &rid) {
                if let Some(queue) = table.get_mut(&rid) {
                    if queue.upgrading == Some(txn.id()) {
                        queue.upgrading = None;
                    }
                }
                return Ok(true);
            }
            cv.wait(&mut table);
        }
    }

    /// Release `txn`'s lock on `rid`. Returns false if no such lock was
    /// held. Drives the 2PL phase transition: any unlock under
    /// REPEATABLE_READ or READ_UNCOMMITTED, and an exclusive unlock under
    /// READ_COMMITTED, moves a growing transaction to shrinking.
    pub fn unlock(&self, txn: &Transaction, rid: &Rid) -> bool {
        let mut table = self.shared.latch.lock();
        Self::unlock_with_table(&mut table, txn, rid)
    }

    /// Wait-for edges as of the current queue contents; test/debug hook.
    pub fn wait_for_edges(&self) -> Vec<(TxnId, TxnId)> {
        let table = self.shared.latch.lock();
        let graph = Self::build_waits_for(&table);
        graph
            .into_iter()
            .flat_map(|(from, tos)| tos.into_iter().map(move |to| (from, to)))
            .collect()
    }

    fn abort(txn: &Transaction, reason: AbortReason) -> TransactionAbortError {
        txn.set_state(TransactionState::Aborted);
        TransactionAbortError {
            txn_id: txn.id(),
            reason,
        }
    }

    /// Shared grantable iff no exclusive request precedes ours; marks our
    /// request granted on success.
    fn try_grant_shared(table: &mut LockTable, txn_id: TxnId, rid: &Rid) -> bool {
        let queue = match table.get_mut(rid) {
            Some(queue) => queue,
            None => return false,
        };
        for request in queue.requests.iter_mut() {
            if request.mode == LockMode::Exclusive {
                return false;
            }
            if request.txn_id == txn_id {
                request.granted = true;
                return true;
            }
        }
        false
    }

    /// Exclusive grantable iff our request heads the queue.
    fn try_grant_exclusive(table: &mut LockTable, txn_id: TxnId, rid: &Rid) -> bool {
        let queue = match table.get_mut(rid) {
            Some(queue) => queue,
            None => return false,
        };
        match queue.requests.front_mut() {
            Some(head) if head.txn_id == txn_id => {
                head.granted = true;
                true
            }
            _ => false,
        }
    }

    fn unlock_with_table(table: &mut LockTable, txn: &Transaction, rid: &Rid) -> bool {
        if txn.state() == TransactionState::Growing {
            let iso = txn.isolation_level();
            let read_committed_shrinking =
                iso == IsolationLevel::ReadCommitted && txn.is_exclusive_locked(rid);
            if read_committed_shrinking || iso != IsolationLevel::ReadCommitted {
                txn.set_state(TransactionState::Shrinking);
            }
        }

        if !table.contains_key(rid) && !txn.is_shared_locked(rid) && !txn.is_exclusive_locked(rid) {
            return false;
        }
        txn.remove_shared_lock(rid);
        txn.remove_exclusive_lock(rid);

        let queue = match table.get_mut(rid) {
            Some(queue) => queue,
            None => return false,
        };
        queue.requests.retain(|request| request.txn_id != txn.id());
        if queue.upgrading == Some(txn.id()) {
            queue.upgrading = None;
        }
        if queue.requests.is_empty() {
            table.remove(rid);
        } else {
            queue.cv.notify_all();
        }
        true
    }

    // ---- deadlock detection ----

    fn run_cycle_detection(shared: Arc<Shared>, interval: Duration) {
        while shared.running.load(Ordering::Acquire) {
            thread::sleep(interval);
            if !shared.running.load(Ordering::Acquire) {
                break;
            }

            let mut table = shared.latch.lock();
            let mut graph = Self::build_waits_for(&table);
            while let Some(victim) = Self::find_cycle(&graph) {
                debug!("wait-for cycle detected, aborting txn {}", victim);
                if let Some(txn) = shared.txn_manager.get_transaction(victim) {
                    txn.set_state(TransactionState::Aborted);
                    for rid in txn.locked_rids() {
                        Self::unlock_with_table(&mut table, &txn, &rid);
                    }
                }
                graph.remove(&victim);
            }
        }
    }

    /// Forward-only wait-for graph, rebuilt from scratch: every ungranted
    /// request waits on every granted request of its queue.
    fn build_waits_for(table: &LockTable) -> BTreeMap<TxnId, Vec<TxnId>> {
        let mut graph: BTreeMap<TxnId, Vec<TxnId>> = BTreeMap::new();
        for queue in table.values() {
            let holders: Vec<TxnId> = queue
                .requests
                .iter()
                .filter(|request| request.granted)
                .map(|request| request.txn_id)
                .collect();
            for waiter in queue.requests.iter().filter(|request| !request.granted) {
                for &holder in &holders {
                    if holder != waiter.txn_id {
                        graph.entry(waiter.txn_id).or_default().push(holder);
                    }
                }
            }
        }
        for successors in graph.values_mut() {
            successors.sort_unstable();
            successors.dedup();
        }
        graph
    }

    /// DFS from every source in ascending txn id, successors ascending. The
    /// victim is the transaction whose edge closes the back-edge, which
    /// under this visit order is deterministic.
    fn find_cycle(graph: &BTreeMap<TxnId, Vec<TxnId>>) -> Option<TxnId> {
        let mut visited: BTreeSet<TxnId> = BTreeSet::new();
        for &start in graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut stack = BTreeSet::new();
            if let Some(victim) = Self::dfs(graph, start, &mut visited, &mut stack) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(
        graph: &BTreeMap<TxnId, Vec<TxnId>>,
        node: TxnId,
        visited: &mut BTreeSet<TxnId>,
        stack: &mut BTreeSet<TxnId>,
    ) -> Option<TxnId> {
        visited.insert(node);
        stack.insert(node);
        if let Some(successors) = graph.get(&node) {
            for &next in successors {
                if stack.contains(&next) {
                    return Some(node);
                }
                if !visited.contains(&next) {
                    if let Some(victim) = Self::dfs(graph, next, visited, stack) {
                        return Some(victim);
                    }
                }
            }
        }
        stack.remove(&node);
        None
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.detector.take() {
            let _ = handle.join();
        }
    }
}
