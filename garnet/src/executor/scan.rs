//! Table access paths: the sequential heap scan and the index range
//! scan.

use std::sync::Arc;

use basalt::index::{Iid, IxIndex, IxScan};
use basalt::lock::LockManager;
use basalt::record::{Record, RecordFile, RecordScan};
use basalt::transaction::Transaction;
use basalt::Rid;

use super::eval::eval_conds;
use crate::catalog::{IndexMeta, TabMeta};
use crate::errors::{DbError, DbResult};
use crate::system::SystemManager;
use crate::value::{CompOp, CondRhs, Condition};

/// Full-file scan under a table-level shared lock.
pub struct SeqScanExecutor<'a> {
    tab: &'a TabMeta,
    conds: Vec<Condition>,
    scan: RecordScan<'a>,
}

impl<'a> SeqScanExecutor<'a> {
    pub fn new(
        sm: &'a SystemManager,
        lock_mgr: &'a LockManager,
        txn: &'a Arc<Transaction>,
        table: &str,
        conds: Vec<Condition>,
    ) -> DbResult<Self> {
        let tab = sm.table(table)?;
        let fh = sm.record_file(table)?;
        if !lock_mgr.lock_shared_on_table(txn, fh.fd()) {
            return Err(DbError::TransactionAborted);
        }
        Ok(Self {
            tab,
            conds,
            scan: fh.scan(),
        })
    }

    pub fn schema(&self) -> &TabMeta {
        self.tab
    }

    pub fn next(&mut self) -> DbResult<Option<(Rid, Record)>> {
        for item in self.scan.by_ref() {
            let (rid, record) = item?;
            if eval_conds(self.tab, &self.conds, &record.data)? {
                return Ok(Some((rid, record)));
            }
        }
        Ok(None)
    }
}

/// Index range scan: IS on the table, S on every record it returns.
pub struct IndexScanExecutor<'a> {
    tab: &'a TabMeta,
    fh: &'a RecordFile,
    lock_mgr: &'a LockManager,
    txn: &'a Arc<Transaction>,
    conds: Vec<Condition>,
    scan: IxScan<'a>,
}

impl<'a> IndexScanExecutor<'a> {
    pub fn new(
        sm: &'a SystemManager,
        lock_mgr: &'a LockManager,
        txn: &'a Arc<Transaction>,
        table: &str,
        index: &IndexMeta,
        conds: Vec<Condition>,
    ) -> DbResult<Self> {
        let tab = sm.table(table)?;
        let fh = sm.record_file(table)?;
        let ih = sm.index_handle(table, &index.col_names)?;
        if !lock_mgr.lock_is_on_table(txn, fh.fd()) {
            return Err(DbError::TransactionAborted);
        }
        let (begin, end) = index_bounds(tab, index, ih, &conds)?;
        Ok(Self {
            tab,
            fh,
            lock_mgr,
            txn,
            conds,
            scan: ih.scan_range(begin, end),
        })
    }

    pub fn schema(&self) -> &TabMeta {
        self.tab
    }

    pub fn next(&mut self) -> DbResult<Option<(Rid, Record)>> {
        for rid in self.scan.by_ref() {
            let rid = rid?;
            if !self.lock_mgr.lock_shared_on_record(self.txn, rid, self.fh.fd()) {
                return Err(DbError::TransactionAborted);
            }
            let record = self.fh.get(rid)?;
            if eval_conds(self.tab, &self.conds, &record.data)? {
                return Ok(Some((rid, record)));
            }
        }
        Ok(None)
    }
}

/// Tightens the scan interval from conditions on the index key. An
/// equality over the whole key pins both ends; a single-column index
/// narrows one end per range operator; `Ne` never tightens.
fn index_bounds(
    tab: &TabMeta,
    index: &IndexMeta,
    ih: &IxIndex,
    conds: &[Condition],
) -> DbResult<(Iid, Iid)> {
    let icols = tab.index_cols(index)?;

    let mut exact = Vec::with_capacity(index.key_len);
    let covered = icols.iter().all(|col| {
        conds.iter().any(|cond| {
            if cond.col != col.name || cond.op != CompOp::Eq {
                return false;
            }
            match &cond.rhs {
                CondRhs::Value(value) => match value.to_bytes(col.ty, col.len) {
                    Ok(bytes) => {
                        exact.extend_from_slice(&bytes);
                        true
                    }
                    Err(_) => false,
                },
                CondRhs::Col(_) => false,
            }
        })
    });
    if covered {
        return Ok((ih.lower_bound(&exact)?, ih.upper_bound(&exact)?));
    }

    if let [col] = icols.as_slice() {
        for cond in conds {
            if cond.col != col.name || cond.op == CompOp::Ne {
                continue;
            }
            let CondRhs::Value(value) = &cond.rhs else {
                continue;
            };
            let key = value.to_bytes(col.ty, col.len)?;
            let bounds = match cond.op {
                CompOp::Eq => (ih.lower_bound(&key)?, ih.upper_bound(&key)?),
                CompOp::Lt => (ih.leaf_begin(), ih.lower_bound(&key)?),
                CompOp::Le => (ih.leaf_begin(), ih.upper_bound(&key)?),
                CompOp::Gt => (ih.upper_bound(&key)?, ih.leaf_end()?),
                CompOp::Ge => (ih.lower_bound(&key)?, ih.leaf_end()?),
                CompOp::Ne => unreachable!(),
            };
            return Ok(bounds);
        }
    }

    Ok((ih.leaf_begin(), ih.leaf_end()?))
}
