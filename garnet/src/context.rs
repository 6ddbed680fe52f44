//! Per-statement execution context: the transaction, the lock manager,
//! and the session output buffer results render into.

use std::sync::Arc;

use basalt::lock::LockManager;
use basalt::transaction::Transaction;

/// Handed to every executor; output accumulates in `output` and, when
/// `mirror_to_file` is on, is also appended to `output.txt` in the
/// current directory.
pub struct Context<'a> {
    pub lock_mgr: &'a LockManager,
    pub txn: &'a Arc<Transaction>,
    pub output: Vec<u8>,
    pub mirror_to_file: bool,
}

impl<'a> Context<'a> {
    pub fn new(lock_mgr: &'a LockManager, txn: &'a Arc<Transaction>) -> Self {
        Self {
            lock_mgr,
            txn,
            output: Vec::new(),
            mirror_to_file: false,
        }
    }

    pub fn output_str(&self) -> String {
        String::from_utf8_lossy(&self.output).to_string()
    }
}
