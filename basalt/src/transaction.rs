//! Transaction lifecycle: begin, commit, abort. Every write a
//! transaction performs is recorded in its write-set; commit discards
//! the set, abort replays it in reverse through the [`UndoTarget`] seam.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock::{LockDataId, LockManager};
use crate::log::LogManager;
use crate::record::Record;
use crate::{Rid, StorageResult};

pub type TxnId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Default,
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Delete,
    Update,
}

/// One logical write, with enough context to undo it.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub kind: WriteKind,
    pub table: String,
    pub rid: Rid,
    /// The pre-write tuple for deletes and updates.
    pub before: Option<Record>,
}

/// A live transaction. Shared between the session, the lock manager and
/// the executors, so its mutable pieces sit behind mutexes.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TxnState>,
    lock_set: Mutex<HashSet<LockDataId>>,
    write_set: Mutex<Vec<WriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TxnState::Default),
            lock_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TxnState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn holds_lock(&self, id: &LockDataId) -> bool {
        self.lock_set.lock().unwrap().contains(id)
    }

    pub fn record_lock(&self, id: LockDataId) {
        self.lock_set.lock().unwrap().insert(id);
    }

    fn drain_locks(&self) -> Vec<LockDataId> {
        self.lock_set.lock().unwrap().drain().collect()
    }

    pub fn append_write(&self, record: WriteRecord) {
        self.write_set.lock().unwrap().push(record);
    }

    fn pop_write(&self) -> Option<WriteRecord> {
        self.write_set.lock().unwrap().pop()
    }

    fn clear_write_set(&self) {
        self.write_set.lock().unwrap().clear();
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.lock().unwrap().len()
    }
}

/// The undo seam the system layer implements: how to reverse one write
/// against the heap and every index of the table.
pub trait UndoTarget {
    /// Removes the inserted row at `rid` and its index entries.
    fn undo_insert(&self, table: &str, rid: Rid) -> StorageResult<()>;

    /// Restores a deleted row at its original `rid`, index entries
    /// included.
    fn undo_delete(&self, table: &str, rid: Rid, before: &Record) -> StorageResult<()>;

    /// Overwrites the row with its before-image and refreshes index
    /// entries.
    fn undo_update(&self, table: &str, rid: Rid, before: &Record) -> StorageResult<()>;
}

/// Owns the registry of live transactions and their lifecycle.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    txn_map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            txn_map: Mutex::new(HashMap::new()),
            lock_manager,
        }
    }

    /// Starts a transaction, or re-registers an existing one.
    pub fn begin(&self, existing: Option<Arc<Transaction>>) -> Arc<Transaction> {
        let txn = existing.unwrap_or_else(|| {
            let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
            Arc::new(Transaction::new(id, IsolationLevel::Serializable))
        });
        crate::basalt_debug_log!("[TransactionManager::begin] txn {}", txn.id());
        self.txn_map.lock().unwrap().insert(txn.id(), txn.clone());
        txn
    }

    pub fn get_transaction(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.txn_map.lock().unwrap().get(&id).cloned()
    }

    /// Commits: the write-set is simply discarded, locks released.
    pub fn commit(&self, txn: &Arc<Transaction>, log: &LogManager) -> StorageResult<()> {
        txn.clear_write_set();
        for id in txn.drain_locks() {
            self.lock_manager.unlock(txn, id);
        }
        txn.set_state(TxnState::Committed);
        log.flush()?;
        self.txn_map.lock().unwrap().remove(&txn.id());
        crate::basalt_debug_log!("[TransactionManager::commit] txn {}", txn.id());
        Ok(())
    }

    /// Aborts: replays the write-set in reverse through `undo`, then
    /// releases locks.
    pub fn abort(
        &self,
        txn: &Arc<Transaction>,
        undo: &dyn UndoTarget,
        log: &LogManager,
    ) -> StorageResult<()> {
        while let Some(write) = txn.pop_write() {
            match write.kind {
                WriteKind::Insert => undo.undo_insert(&write.table, write.rid)?,
                WriteKind::Delete => {
                    let before = write
                        .before
                        .as_ref()
                        .expect("delete write record carries its before-image");
                    undo.undo_delete(&write.table, write.rid, before)?;
                }
                WriteKind::Update => {
                    let before = write
                        .before
                        .as_ref()
                        .expect("update write record carries its before-image");
                    undo.undo_update(&write.table, write.rid, before)?;
                }
            }
        }
        for id in txn.drain_locks() {
            self.lock_manager.unlock(txn, id);
        }
        txn.set_state(TxnState::Aborted);
        log.flush()?;
        self.txn_map.lock().unwrap().remove(&txn.id());
        crate::basalt_debug_log!("[TransactionManager::abort] txn {}", txn.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingUndo {
        calls: Mutex<Vec<String>>,
    }

    impl UndoTarget for RecordingUndo {
        fn undo_insert(&self, table: &str, rid: Rid) -> StorageResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("insert {table} ({}, {})", rid.page_no, rid.slot_no));
            Ok(())
        }

        fn undo_delete(&self, table: &str, rid: Rid, _before: &Record) -> StorageResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete {table} ({}, {})", rid.page_no, rid.slot_no));
            Ok(())
        }

        fn undo_update(&self, table: &str, rid: Rid, _before: &Record) -> StorageResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("update {table} ({}, {})", rid.page_no, rid.slot_no));
            Ok(())
        }
    }

    fn manager() -> (tempfile::TempDir, TransactionManager, LogManager) {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path().join("LOG")).unwrap();
        let tm = TransactionManager::new(Arc::new(LockManager::new()));
        (dir, tm, log)
    }

    #[test]
    fn begin_hands_out_monotonic_ids() {
        let (_dir, tm, _log) = manager();
        let t1 = tm.begin(None);
        let t2 = tm.begin(None);
        assert!(t2.id() > t1.id());
        assert_eq!(t1.isolation_level(), IsolationLevel::Serializable);
        assert!(tm.get_transaction(t1.id()).is_some());
    }

    #[test]
    fn begin_reuses_a_supplied_transaction() {
        let (_dir, tm, _log) = manager();
        let existing = Arc::new(Transaction::new(99, IsolationLevel::Serializable));
        let txn = tm.begin(Some(existing.clone()));
        assert_eq!(txn.id(), 99);
        assert!(Arc::ptr_eq(&txn, &existing));
    }

    #[test]
    fn commit_discards_writes_and_releases_locks() {
        let (_dir, tm, log) = manager();
        let txn = tm.begin(None);
        txn.append_write(WriteRecord {
            kind: WriteKind::Insert,
            table: "t".into(),
            rid: Rid::new(1, 0),
            before: None,
        });
        txn.record_lock(LockDataId::table(0));

        tm.commit(&txn, &log).unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(txn.write_set_len(), 0);
        assert!(!txn.holds_lock(&LockDataId::table(0)));
        assert!(tm.get_transaction(txn.id()).is_none());
    }

    #[test]
    fn abort_replays_writes_in_reverse() {
        let (_dir, tm, log) = manager();
        let txn = tm.begin(None);
        let before = Record { data: vec![0; 4] };
        txn.append_write(WriteRecord {
            kind: WriteKind::Insert,
            table: "t".into(),
            rid: Rid::new(1, 0),
            before: None,
        });
        txn.append_write(WriteRecord {
            kind: WriteKind::Update,
            table: "t".into(),
            rid: Rid::new(1, 1),
            before: Some(before.clone()),
        });
        txn.append_write(WriteRecord {
            kind: WriteKind::Delete,
            table: "t".into(),
            rid: Rid::new(1, 2),
            before: Some(before),
        });

        let undo = RecordingUndo::default();
        tm.abort(&txn, &undo, &log).unwrap();
        assert_eq!(txn.state(), TxnState::Aborted);
        assert_eq!(
            *undo.calls.lock().unwrap(),
            vec![
                "delete t (1, 2)".to_string(),
                "update t (1, 1)".to_string(),
                "insert t (1, 0)".to_string(),
            ]
        );
    }
}
