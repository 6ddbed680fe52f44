//! Multi-granularity strict two-phase locking over tables and records.
//! One mutex guards the whole lock table; each entry carries a FIFO
//! request queue, a cached group mode, and a condition variable waiters
//! block on.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::transaction::{IsolationLevel, Transaction, TxnId, TxnState};
use crate::{Fd, Rid};

/// Lock modes a transaction can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// The join of all granted modes on one lock entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupLockMode {
    NonLock,
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    fn as_group(self) -> GroupLockMode {
        match self {
            LockMode::IntentionShared => GroupLockMode::IntentionShared,
            LockMode::IntentionExclusive => GroupLockMode::IntentionExclusive,
            LockMode::Shared => GroupLockMode::Shared,
            LockMode::SharedIntentionExclusive => GroupLockMode::SharedIntentionExclusive,
            LockMode::Exclusive => GroupLockMode::Exclusive,
        }
    }
}

/// Whether a request is compatible with the modes already granted.
fn compatible(requested: LockMode, group: GroupLockMode) -> bool {
    use GroupLockMode as G;
    use LockMode as M;
    match requested {
        M::IntentionShared => group != G::Exclusive,
        M::IntentionExclusive => matches!(
            group,
            G::NonLock | G::IntentionShared | G::IntentionExclusive
        ),
        M::Shared => matches!(group, G::NonLock | G::IntentionShared | G::Shared),
        M::SharedIntentionExclusive => matches!(group, G::NonLock | G::IntentionShared),
        M::Exclusive => group == G::NonLock,
    }
}

/// Lattice join of two group modes (`S ∨ IX = SIX`, `X` absorbs).
fn join(a: GroupLockMode, b: GroupLockMode) -> GroupLockMode {
    use GroupLockMode as G;
    match (a, b) {
        (G::Exclusive, _) | (_, G::Exclusive) => G::Exclusive,
        (G::SharedIntentionExclusive, _) | (_, G::SharedIntentionExclusive) => {
            G::SharedIntentionExclusive
        }
        (G::Shared, G::IntentionExclusive) | (G::IntentionExclusive, G::Shared) => {
            G::SharedIntentionExclusive
        }
        (G::Shared, _) | (_, G::Shared) => G::Shared,
        (G::IntentionExclusive, _) | (_, G::IntentionExclusive) => G::IntentionExclusive,
        (G::IntentionShared, _) | (_, G::IntentionShared) => G::IntentionShared,
        (G::NonLock, G::NonLock) => G::NonLock,
    }
}

/// The granularity a lock covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTarget {
    Table,
    Record(Rid),
}

/// Identifies one lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockDataId {
    pub fd: Fd,
    pub target: LockTarget,
}

impl LockDataId {
    pub fn table(fd: Fd) -> Self {
        Self {
            fd,
            target: LockTarget::Table,
        }
    }

    pub fn record(fd: Fd, rid: Rid) -> Self {
        Self {
            fd,
            target: LockTarget::Record(rid),
        }
    }
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug)]
struct LockEntry {
    group_mode: GroupLockMode,
    queue: VecDeque<LockRequest>,
    cv: Arc<Condvar>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            group_mode: GroupLockMode::NonLock,
            queue: VecDeque::new(),
            cv: Arc::new(Condvar::new()),
        }
    }

    fn recompute_group_mode(&mut self) {
        self.group_mode = self
            .queue
            .iter()
            .filter(|r| r.granted)
            .fold(GroupLockMode::NonLock, |acc, r| join(acc, r.mode.as_group()));
    }
}

/// The lock manager.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<HashMap<LockDataId, LockEntry>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_shared_on_record(&self, txn: &Transaction, rid: Rid, fd: Fd) -> bool {
        self.acquire(txn, LockDataId::record(fd, rid), LockMode::Shared)
    }

    pub fn lock_exclusive_on_record(&self, txn: &Transaction, rid: Rid, fd: Fd) -> bool {
        self.acquire(txn, LockDataId::record(fd, rid), LockMode::Exclusive)
    }

    pub fn lock_shared_on_table(&self, txn: &Transaction, fd: Fd) -> bool {
        self.acquire(txn, LockDataId::table(fd), LockMode::Shared)
    }

    pub fn lock_exclusive_on_table(&self, txn: &Transaction, fd: Fd) -> bool {
        self.acquire(txn, LockDataId::table(fd), LockMode::Exclusive)
    }

    pub fn lock_is_on_table(&self, txn: &Transaction, fd: Fd) -> bool {
        self.acquire(txn, LockDataId::table(fd), LockMode::IntentionShared)
    }

    pub fn lock_ix_on_table(&self, txn: &Transaction, fd: Fd) -> bool {
        self.acquire(txn, LockDataId::table(fd), LockMode::IntentionExclusive)
    }

    fn acquire(&self, txn: &Transaction, id: LockDataId, mode: LockMode) -> bool {
        let mut table = self.table.lock().unwrap();

        // 1. Gate on isolation level and the two-phase rule.
        let wants_shared = matches!(mode, LockMode::Shared | LockMode::IntentionShared);
        if (txn.isolation_level() == IsolationLevel::ReadUncommitted && wants_shared)
            || txn.state() == TxnState::Shrinking
        {
            txn.set_state(TxnState::Aborted);
        }
        if txn.state() == TxnState::Aborted {
            return false;
        }
        txn.set_state(TxnState::Growing);

        // 2. Re-request on a held resource upgrades the grant in place.
        if txn.holds_lock(&id) {
            let entry = table.entry(id).or_insert_with(LockEntry::new);
            if let Some(req) = entry
                .queue
                .iter_mut()
                .find(|r| r.txn_id == txn.id() && r.granted)
            {
                req.mode = upgraded_request_mode(req.mode, mode);
            }
            entry.group_mode = upgraded_group_mode(entry.group_mode, mode);
            entry.cv.notify_all();
            return true;
        }

        // 3. Fresh request: queue up and wait out incompatible grants.
        txn.record_lock(id);
        let entry = table.entry(id).or_insert_with(LockEntry::new);
        entry.queue.push_back(LockRequest {
            txn_id: txn.id(),
            mode,
            granted: false,
        });

        loop {
            let (granted_set_allows, cv) = {
                let entry = table.get(&id).expect("lock entry vanished while queued");
                (compatible(mode, entry.group_mode), entry.cv.clone())
            };
            if granted_set_allows {
                break;
            }
            table = cv.wait(table).unwrap();
        }

        let entry = table.get_mut(&id).expect("lock entry vanished while queued");
        let request = entry
            .queue
            .iter_mut()
            .find(|r| r.txn_id == txn.id() && !r.granted)
            .expect("queued request vanished");
        request.granted = true;
        entry.group_mode = join(entry.group_mode, mode.as_group());
        entry.cv.notify_all();
        true
    }

    /// Releases one grant. The transaction enters its shrinking phase.
    pub fn unlock(&self, txn: &Transaction, id: LockDataId) -> bool {
        let mut table = self.table.lock().unwrap();
        txn.set_state(TxnState::Shrinking);
        if !txn.holds_lock(&id) {
            return false;
        }
        if let Some(entry) = table.get_mut(&id) {
            entry.queue.retain(|r| r.txn_id != txn.id());
            entry.recompute_group_mode();
            entry.cv.notify_all();
            if entry.queue.is_empty() {
                table.remove(&id);
            }
        }
        true
    }

    /// The current group mode of a resource (`NonLock` when untracked).
    pub fn group_mode(&self, id: LockDataId) -> GroupLockMode {
        self.table
            .lock()
            .unwrap()
            .get(&id)
            .map_or(GroupLockMode::NonLock, |e| e.group_mode)
    }
}

/// The mode a held request ends up in after an upgrade.
fn upgraded_request_mode(held: LockMode, requested: LockMode) -> LockMode {
    use LockMode as M;
    match (held, requested) {
        (M::Exclusive, _) | (_, M::Exclusive) => M::Exclusive,
        (M::SharedIntentionExclusive, _) | (_, M::SharedIntentionExclusive) => {
            M::SharedIntentionExclusive
        }
        (M::Shared, M::IntentionExclusive) | (M::IntentionExclusive, M::Shared) => {
            M::SharedIntentionExclusive
        }
        (M::Shared, _) | (_, M::Shared) => M::Shared,
        (M::IntentionExclusive, _) | (_, M::IntentionExclusive) => M::IntentionExclusive,
        _ => M::IntentionShared,
    }
}

/// In-place group upgrade for a re-request on a held resource.
fn upgraded_group_mode(group: GroupLockMode, requested: LockMode) -> GroupLockMode {
    use GroupLockMode as G;
    use LockMode as M;
    match requested {
        M::Exclusive => G::Exclusive,
        M::Shared => match group {
            G::IntentionExclusive => G::SharedIntentionExclusive,
            G::NonLock | G::IntentionShared => G::Shared,
            other => other,
        },
        M::IntentionExclusive => match group {
            G::Shared => G::SharedIntentionExclusive,
            G::NonLock | G::IntentionShared => G::IntentionExclusive,
            other => other,
        },
        M::IntentionShared => match group {
            G::NonLock => G::IntentionShared,
            other => other,
        },
        M::SharedIntentionExclusive => match group {
            G::Exclusive => G::Exclusive,
            _ => G::SharedIntentionExclusive,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn txn(id: TxnId) -> Transaction {
        Transaction::new(id, IsolationLevel::Serializable)
    }

    #[test]
    fn compatibility_matrix() {
        use GroupLockMode as G;
        use LockMode as M;
        let granted = [
            (M::IntentionShared, G::IntentionShared),
            (M::IntentionExclusive, G::IntentionExclusive),
            (M::Shared, G::Shared),
            (M::SharedIntentionExclusive, G::SharedIntentionExclusive),
            (M::Exclusive, G::Exclusive),
        ];
        let expected = [
            // IS     IX     S      SIX    X
            [true, true, true, true, false],
            [true, true, false, false, false],
            [true, false, true, false, false],
            [true, false, false, false, false],
            [false, false, false, false, false],
        ];
        for (row, &(_, group)) in granted.iter().enumerate() {
            for (col, &(mode, _)) in granted.iter().enumerate() {
                assert_eq!(
                    compatible(mode, group),
                    expected[row][col],
                    "granted {group:?} requested {mode:?}"
                );
            }
        }
    }

    #[test]
    fn join_builds_six_from_s_and_ix() {
        use GroupLockMode as G;
        assert_eq!(
            join(G::Shared, G::IntentionExclusive),
            G::SharedIntentionExclusive
        );
        assert_eq!(join(G::NonLock, G::IntentionShared), G::IntentionShared);
        assert_eq!(join(G::Shared, G::Exclusive), G::Exclusive);
        assert_eq!(join(G::IntentionShared, G::IntentionExclusive), G::IntentionExclusive);
    }

    #[test]
    fn shared_locks_coexist() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_shared_on_record(&t1, rid, 0));
        assert!(lm.lock_shared_on_record(&t2, rid, 0));
        assert_eq!(
            lm.group_mode(LockDataId::record(0, rid)),
            GroupLockMode::Shared
        );
    }

    #[test]
    fn exclusive_waits_for_readers_to_leave() {
        let lm = Arc::new(LockManager::new());
        let t1 = Arc::new(txn(1));
        let t2 = Arc::new(txn(2));
        let rid = Rid::new(1, 0);

        assert!(lm.lock_shared_on_record(&t1, rid, 0));
        assert!(lm.lock_shared_on_record(&t2, rid, 0));

        let got_x = Arc::new(AtomicBool::new(false));
        let writer = {
            let lm = lm.clone();
            let got_x = got_x.clone();
            thread::spawn(move || {
                let t3 = txn(3);
                assert!(lm.lock_exclusive_on_record(&t3, rid, 0));
                got_x.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!got_x.load(Ordering::SeqCst), "X granted alongside S");

        assert!(lm.unlock(&t1, LockDataId::record(0, rid)));
        thread::sleep(Duration::from_millis(50));
        assert!(!got_x.load(Ordering::SeqCst), "X granted with one S left");

        assert!(lm.unlock(&t2, LockDataId::record(0, rid)));
        writer.join().unwrap();
        assert!(got_x.load(Ordering::SeqCst));
        assert_eq!(
            lm.group_mode(LockDataId::record(0, rid)),
            GroupLockMode::Exclusive
        );
    }

    #[test]
    fn lock_after_unlock_aborts_the_transaction() {
        let lm = LockManager::new();
        let t1 = txn(1);

        assert!(lm.lock_shared_on_table(&t1, 0));
        assert!(lm.unlock(&t1, LockDataId::table(0)));
        assert_eq!(t1.state(), TxnState::Shrinking);

        assert!(!lm.lock_shared_on_record(&t1, Rid::new(1, 0), 0));
        assert_eq!(t1.state(), TxnState::Aborted);
    }

    #[test]
    fn read_uncommitted_cannot_take_shared_locks() {
        let lm = LockManager::new();
        let t1 = Transaction::new(1, IsolationLevel::ReadUncommitted);
        assert!(!lm.lock_shared_on_table(&t1, 0));
        assert_eq!(t1.state(), TxnState::Aborted);
    }

    #[test]
    fn intention_modes_follow_the_hierarchy() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);

        assert!(lm.lock_ix_on_table(&t1, 0));
        assert!(lm.lock_is_on_table(&t2, 0));
        assert_eq!(
            lm.group_mode(LockDataId::table(0)),
            GroupLockMode::IntentionExclusive
        );

        // A third transaction cannot get S while IX is granted.
        let blocked = Arc::new(AtomicBool::new(false));
        let lm = Arc::new(lm);
        let handle = {
            let lm = lm.clone();
            let blocked = blocked.clone();
            thread::spawn(move || {
                let t3 = txn(3);
                assert!(lm.lock_shared_on_table(&t3, 0));
                blocked.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.load(Ordering::SeqCst));

        lm.unlock(&t1, LockDataId::table(0));
        handle.join().unwrap();
    }

    #[test]
    fn re_request_upgrades_in_place() {
        let lm = LockManager::new();
        let t1 = txn(1);

        assert!(lm.lock_shared_on_table(&t1, 0));
        assert!(lm.lock_ix_on_table(&t1, 0));
        assert_eq!(
            lm.group_mode(LockDataId::table(0)),
            GroupLockMode::SharedIntentionExclusive
        );

        assert!(lm.lock_exclusive_on_table(&t1, 0));
        assert_eq!(
            lm.group_mode(LockDataId::table(0)),
            GroupLockMode::Exclusive
        );
    }

    #[test]
    fn unlock_recomputes_the_surviving_group_mode() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);

        assert!(lm.lock_is_on_table(&t1, 0));
        assert!(lm.lock_ix_on_table(&t2, 0));
        assert_eq!(
            lm.group_mode(LockDataId::table(0)),
            GroupLockMode::IntentionExclusive
        );

        assert!(lm.unlock(&t2, LockDataId::table(0)));
        assert_eq!(
            lm.group_mode(LockDataId::table(0)),
            GroupLockMode::IntentionShared
        );
    }
}
