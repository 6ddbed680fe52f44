//! # Garnet Database
//! System layer over the Basalt storage kernel: catalog, system
//! manager, transaction glue and the volcano executors. The SQL text
//! surface (parser, planner, session) lives outside this crate and
//! feeds [`plan::Plan`] values in.

use std::path::Path;
use std::sync::Arc;

use basalt::lock::LockManager;
use basalt::transaction::{Transaction, TransactionManager};

/// Catalog metadata and its persistence.
pub mod catalog;
/// Per-statement execution context.
pub mod context;
/// The system-layer error taxonomy.
pub mod errors;
/// Volcano executors and the statement dispatcher.
pub mod executor;
/// The sealed statement surface.
pub mod plan;
/// Result rendering.
pub mod printer;
/// Database/table/index lifecycle and rollback.
pub mod system;
/// Typed values and conditions.
pub mod value;

pub use context::Context;
pub use errors::{DbError, DbResult};
pub use executor::{execute, ExecuteResult, ResultSet};
pub use system::SystemManager;

pub fn debug_logs_enabled() -> bool {
    std::env::var_os("GARNET_DEBUG_LOG").is_some()
}

#[macro_export]
macro_rules! garnet_debug_log {
    ($($arg:tt)*) => {
        if $crate::debug_logs_enabled() {
            println!($($arg)*);
        }
    };
}

/// One open database with its lock and transaction managers. Sessions
/// build a [`Context`] per transaction and feed plans to
/// [`executor::execute`].
pub struct Database {
    pub sm: SystemManager,
    pub lm: Arc<LockManager>,
    pub tm: TransactionManager,
}

impl Database {
    /// Opens a database under `base`, creating it first if missing.
    pub fn open<P: AsRef<Path>>(base: P, name: &str) -> DbResult<Self> {
        let mut sm = SystemManager::new(base);
        match sm.open_db(name) {
            Ok(()) => {}
            Err(DbError::DatabaseNotFound(_)) => {
                sm.create_db(name)?;
                sm.open_db(name)?;
            }
            Err(e) => return Err(e),
        }
        let lm = Arc::new(LockManager::new());
        let tm = TransactionManager::new(lm.clone());
        Ok(Self { sm, lm, tm })
    }

    pub fn begin(&self) -> Arc<Transaction> {
        self.tm.begin(None)
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> DbResult<()> {
        self.tm.commit(txn, self.sm.log()?)?;
        Ok(())
    }

    /// Rolls the transaction's writes back through the system manager.
    pub fn abort(&self, txn: &Arc<Transaction>) -> DbResult<()> {
        self.tm.abort(txn, &self.sm, self.sm.log()?)?;
        Ok(())
    }

    pub fn close(mut self) -> DbResult<()> {
        self.sm.close_db()
    }
}
