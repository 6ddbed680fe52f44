//! DML entry points: insert, delete, update. Each takes IX on the table
//! and X on every touched record, maintains all the table's indexes, and
//! appends an undo record to the transaction's write-set.

use std::sync::Arc;

use basalt::lock::LockManager;
use basalt::record::Record;
use basalt::transaction::{Transaction, WriteKind, WriteRecord};
use basalt::Rid;

use super::eval::eval_conds;
use crate::errors::{DbError, DbResult};
use crate::system::{index_file_name, SystemManager};
use crate::value::{Condition, SetClause, Value};

pub fn insert_into(
    sm: &SystemManager,
    lock_mgr: &LockManager,
    txn: &Arc<Transaction>,
    table: &str,
    values: &[Value],
) -> DbResult<usize> {
    let tab = sm.table(table)?;
    if values.len() != tab.cols.len() {
        return Err(DbError::Internal(format!(
            "table {table} has {} columns but {} values were supplied",
            tab.cols.len(),
            values.len()
        )));
    }
    let mut data = Vec::with_capacity(tab.record_size());
    for (value, col) in values.iter().zip(&tab.cols) {
        data.extend_from_slice(&value.to_bytes(col.ty, col.len)?);
    }

    let fh = sm.record_file(table)?;
    if !lock_mgr.lock_ix_on_table(txn, fh.fd()) {
        return Err(DbError::TransactionAborted);
    }
    let rid = fh.insert(&data)?;
    if !lock_mgr.lock_exclusive_on_record(txn, rid, fh.fd()) {
        fh.delete(rid)?;
        return Err(DbError::TransactionAborted);
    }

    // Index maintenance; a unique-key clash unwinds everything done so
    // far.
    let mut added: Vec<usize> = Vec::new();
    for (i, index) in tab.indexes.iter().enumerate() {
        let key = tab.index_key(index, &data)?;
        let ih = sm.index_handle(table, &index.col_names)?;
        if ih.insert_entry(&key, rid)? {
            added.push(i);
            continue;
        }
        for &done in &added {
            let undo_index = &tab.indexes[done];
            let undo_key = tab.index_key(undo_index, &data)?;
            sm.index_handle(table, &undo_index.col_names)?
                .delete_entry(&undo_key)?;
        }
        fh.delete(rid)?;
        return Err(DbError::DuplicateKey(index_file_name(
            table,
            &index.col_names,
        )));
    }

    txn.append_write(WriteRecord {
        kind: WriteKind::Insert,
        table: table.to_string(),
        rid,
        before: None,
    });
    Ok(1)
}

/// Collects the rids and rows matching the conditions with a heap walk,
/// taking a shared lock on every row it reads; the caller's exclusive
/// requests later upgrade the matching ones.
fn collect_matching(
    sm: &SystemManager,
    lock_mgr: &LockManager,
    txn: &Arc<Transaction>,
    table: &str,
    conds: &[Condition],
) -> DbResult<Vec<(Rid, Record)>> {
    let tab = sm.table(table)?;
    let fh = sm.record_file(table)?;
    let mut matching = Vec::new();
    for item in fh.scan() {
        let (rid, record) = item?;
        if !lock_mgr.lock_shared_on_record(txn, rid, fh.fd()) {
            return Err(DbError::TransactionAborted);
        }
        if eval_conds(tab, conds, &record.data)? {
            matching.push((rid, record));
        }
    }
    Ok(matching)
}

pub fn delete_from(
    sm: &SystemManager,
    lock_mgr: &LockManager,
    txn: &Arc<Transaction>,
    table: &str,
    conds: &[Condition],
) -> DbResult<usize> {
    let tab = sm.table(table)?;
    let fh = sm.record_file(table)?;
    if !lock_mgr.lock_ix_on_table(txn, fh.fd()) {
        return Err(DbError::TransactionAborted);
    }

    let matching = collect_matching(sm, lock_mgr, txn, table, conds)?;
    for (rid, record) in &matching {
        if !lock_mgr.lock_exclusive_on_record(txn, *rid, fh.fd()) {
            return Err(DbError::TransactionAborted);
        }
        for index in &tab.indexes {
            let key = tab.index_key(index, &record.data)?;
            sm.index_handle(table, &index.col_names)?
                .delete_entry(&key)?;
        }
        fh.delete(*rid)?;
        txn.append_write(WriteRecord {
            kind: WriteKind::Delete,
            table: table.to_string(),
            rid: *rid,
            before: Some(record.clone()),
        });
    }
    Ok(matching.len())
}

pub fn update_table(
    sm: &SystemManager,
    lock_mgr: &LockManager,
    txn: &Arc<Transaction>,
    table: &str,
    sets: &[SetClause],
    conds: &[Condition],
) -> DbResult<usize> {
    let tab = sm.table(table)?;
    let fh = sm.record_file(table)?;

    // Resolve assignments up front so a bad column fails before any
    // write.
    let mut patches = Vec::with_capacity(sets.len());
    for set in sets {
        let col = tab.get_col(&set.col)?;
        patches.push((col.offset, set.value.to_bytes(col.ty, col.len)?));
    }

    if !lock_mgr.lock_ix_on_table(txn, fh.fd()) {
        return Err(DbError::TransactionAborted);
    }

    let matching = collect_matching(sm, lock_mgr, txn, table, conds)?;
    for (rid, old) in &matching {
        if !lock_mgr.lock_exclusive_on_record(txn, *rid, fh.fd()) {
            return Err(DbError::TransactionAborted);
        }

        let mut new_data = old.data.clone();
        for (offset, bytes) in &patches {
            new_data[*offset..*offset + bytes.len()].copy_from_slice(bytes);
        }

        for index in &tab.indexes {
            let old_key = tab.index_key(index, &old.data)?;
            let new_key = tab.index_key(index, &new_data)?;
            if old_key == new_key {
                continue;
            }
            let ih = sm.index_handle(table, &index.col_names)?;
            ih.delete_entry(&old_key)?;
            if !ih.insert_entry(&new_key, *rid)? {
                ih.insert_entry(&old_key, *rid)?;
                return Err(DbError::DuplicateKey(index_file_name(
                    table,
                    &index.col_names,
                )));
            }
        }

        fh.update(*rid, &new_data)?;
        txn.append_write(WriteRecord {
            kind: WriteKind::Update,
            table: table.to_string(),
            rid: *rid,
            before: Some(old.clone()),
        });
    }
    Ok(matching.len())
}
