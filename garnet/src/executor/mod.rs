//! Statement execution: a sealed executor sum type over the access
//! paths, and the dispatcher mapping plans onto the system manager, the
//! DML operators and the select pipeline.

pub mod ddl;
pub mod dml;
pub mod eval;
pub mod join;
pub mod scan;

use basalt::record::Record;
use basalt::Rid;

use crate::catalog::{IndexMeta, TabMeta};
use crate::context::Context;
use crate::errors::DbResult;
use crate::plan::{DmlPlan, Plan, SelectPlan};
use crate::printer::RecordPrinter;
use crate::system::SystemManager;
use crate::value::{CompOp, CondRhs, Condition, Value};

use join::{NestedLoopJoinExecutor, ProjectionExecutor};
use scan::{IndexScanExecutor, SeqScanExecutor};

/// The volcano operators. Every variant exposes the same lazy
/// `next() -> (Rid, Record)` stream.
pub enum QueryExecutor<'a> {
    SeqScan(SeqScanExecutor<'a>),
    IndexScan(IndexScanExecutor<'a>),
    NestedLoopJoin(Box<NestedLoopJoinExecutor<'a>>),
    Projection(Box<ProjectionExecutor<'a>>),
}

impl<'a> QueryExecutor<'a> {
    pub fn schema(&self) -> &TabMeta {
        match self {
            QueryExecutor::SeqScan(e) => e.schema(),
            QueryExecutor::IndexScan(e) => e.schema(),
            QueryExecutor::NestedLoopJoin(e) => e.schema(),
            QueryExecutor::Projection(e) => e.schema(),
        }
    }

    pub fn next(&mut self) -> DbResult<Option<(Rid, Record)>> {
        match self {
            QueryExecutor::SeqScan(e) => e.next(),
            QueryExecutor::IndexScan(e) => e.next(),
            QueryExecutor::NestedLoopJoin(e) => e.next(),
            QueryExecutor::Projection(e) => e.next(),
        }
    }
}

/// Materialized rows of one SELECT.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// What one statement produced.
#[derive(Debug)]
pub enum ExecuteResult {
    Ddl,
    Help,
    ShowTables,
    DescTable,
    /// Transaction control is the session's job; these are markers.
    Begin,
    Commit,
    Abort,
    Insert(usize),
    Delete(usize),
    Update(usize),
    ResultSet(ResultSet),
}

const HELP_TEXT: &str = "\
supported statements:
  CREATE TABLE tab (col type, ...);    DROP TABLE tab;
  CREATE INDEX tab (col, ...);         DROP INDEX tab (col, ...);
  INSERT INTO tab VALUES (...);        DELETE FROM tab WHERE ...;
  UPDATE tab SET col = val WHERE ...;  SELECT cols FROM tab WHERE ...;
  SHOW TABLES;  DESC tab;  BEGIN;  COMMIT;  ABORT;  HELP;
types: INT, FLOAT, CHAR(n)    operators: = <> < > <= >= (AND-joined)
";

/// Runs one statement to completion.
pub fn execute(plan: &Plan, sm: &mut SystemManager, ctx: &mut Context<'_>) -> DbResult<ExecuteResult> {
    match plan {
        Plan::Ddl(ddl_plan) => ddl::execute_ddl(ddl_plan, sm),
        Plan::Help => {
            ctx.output.extend_from_slice(HELP_TEXT.as_bytes());
            Ok(ExecuteResult::Help)
        }
        Plan::ShowTables => {
            sm.show_tables(ctx)?;
            Ok(ExecuteResult::ShowTables)
        }
        Plan::DescTable(name) => {
            sm.desc_table(ctx, name)?;
            Ok(ExecuteResult::DescTable)
        }
        Plan::BeginTxn => Ok(ExecuteResult::Begin),
        Plan::Commit => Ok(ExecuteResult::Commit),
        Plan::Abort => Ok(ExecuteResult::Abort),
        Plan::Dml(dml_plan) => match dml_plan {
            DmlPlan::Insert { table, values } => Ok(ExecuteResult::Insert(dml::insert_into(
                sm,
                ctx.lock_mgr,
                ctx.txn,
                table,
                values,
            )?)),
            DmlPlan::Delete { table, conds } => Ok(ExecuteResult::Delete(dml::delete_from(
                sm,
                ctx.lock_mgr,
                ctx.txn,
                table,
                conds,
            )?)),
            DmlPlan::Update {
                table,
                sets,
                conds,
            } => Ok(ExecuteResult::Update(dml::update_table(
                sm,
                ctx.lock_mgr,
                ctx.txn,
                table,
                sets,
                conds,
            )?)),
            DmlPlan::Select(select_plan) => select(sm, ctx, select_plan),
        },
    }
}

/// Chooses an index for a single-table selection: full equality
/// coverage wins, then a single-column index with any sargable
/// condition. `<>` never uses an index.
fn pick_index(tab: &TabMeta, conds: &[Condition]) -> Option<IndexMeta> {
    let eq_covered = |name: &String| {
        conds
            .iter()
            .any(|c| &c.col == name && c.op == CompOp::Eq && matches!(c.rhs, CondRhs::Value(_)))
    };
    if let Some(index) = tab
        .indexes
        .iter()
        .find(|ix| ix.col_names.iter().all(|name| eq_covered(name)))
    {
        return Some(index.clone());
    }
    tab.indexes
        .iter()
        .find(|ix| match ix.col_names.as_slice() {
            [name] => conds
                .iter()
                .any(|c| &c.col == name && c.op != CompOp::Ne && matches!(c.rhs, CondRhs::Value(_))),
            _ => false,
        })
        .cloned()
}

/// Builds the access path for one table of a selection.
fn build_scan<'a>(
    sm: &'a SystemManager,
    ctx: &Context<'a>,
    table: &str,
    conds: Vec<Condition>,
) -> DbResult<QueryExecutor<'a>> {
    let tab = sm.table(table)?;
    match pick_index(tab, &conds) {
        Some(index) => Ok(QueryExecutor::IndexScan(IndexScanExecutor::new(
            sm,
            ctx.lock_mgr,
            ctx.txn,
            table,
            &index,
            conds,
        )?)),
        None => Ok(QueryExecutor::SeqScan(SeqScanExecutor::new(
            sm,
            ctx.lock_mgr,
            ctx.txn,
            table,
            conds,
        )?)),
    }
}

/// Splits the WHERE conjuncts of a two-table selection into per-side
/// filters and cross-table join predicates.
fn split_join_conds(
    left: &TabMeta,
    right: &TabMeta,
    conds: &[Condition],
) -> (Vec<Condition>, Vec<Condition>, Vec<Condition>) {
    let mut left_conds = Vec::new();
    let mut right_conds = Vec::new();
    let mut join_conds = Vec::new();
    for cond in conds {
        let lhs_in_left = left.get_col(&cond.col).is_ok();
        match &cond.rhs {
            CondRhs::Col(rhs_name) => {
                let rhs_in_left = left.get_col(rhs_name).is_ok();
                if lhs_in_left == rhs_in_left {
                    // Same side both ends: a plain per-side filter.
                    if lhs_in_left {
                        left_conds.push(cond.clone());
                    } else {
                        right_conds.push(cond.clone());
                    }
                } else {
                    join_conds.push(cond.clone());
                }
            }
            CondRhs::Value(_) => {
                if lhs_in_left {
                    left_conds.push(cond.clone());
                } else if right.get_col(&cond.col).is_ok() {
                    right_conds.push(cond.clone());
                } else {
                    // Let the join-level filter surface ColumnNotFound.
                    join_conds.push(cond.clone());
                }
            }
        }
    }
    (left_conds, right_conds, join_conds)
}

/// Runs a selection to completion: access path, optional join, optional
/// projection, then rendering.
fn select(
    sm: &mut SystemManager,
    ctx: &mut Context<'_>,
    plan: &SelectPlan,
) -> DbResult<ExecuteResult> {
    let sm = &*sm;
    let rows;
    let columns: Vec<String>;
    {
        let mut root = match plan.tables.as_slice() {
            [table] => build_scan(sm, ctx, table, plan.conds.clone())?,
            [left, right] => {
                let (left_conds, right_conds, join_conds) =
                    split_join_conds(sm.table(left)?, sm.table(right)?, &plan.conds);
                let outer = build_scan(sm, ctx, left, left_conds)?;
                let inner = build_scan(sm, ctx, right, right_conds)?;
                QueryExecutor::NestedLoopJoin(Box::new(NestedLoopJoinExecutor::new(
                    outer, inner, join_conds,
                )?))
            }
            _ => {
                return Err(crate::errors::DbError::Internal(format!(
                    "selection over {} tables is not supported",
                    plan.tables.len()
                )))
            }
        };
        if !plan.cols.is_empty() {
            root = QueryExecutor::Projection(Box::new(ProjectionExecutor::new(root, &plan.cols)?));
        }

        columns = root.schema().cols.iter().map(|c| c.name.clone()).collect();
        let schema = root.schema().clone();
        let mut materialized = Vec::new();
        while let Some((_, record)) = root.next()? {
            let row: Vec<String> = schema
                .cols
                .iter()
                .map(|col| {
                    Value::from_bytes(col.ty, &record.data[col.offset..col.offset + col.len])
                        .to_string()
                })
                .collect();
            materialized.push(row);
        }
        rows = materialized;
    }

    let printer = RecordPrinter::new(columns.len());
    printer.print_separator(ctx)?;
    printer.print_record(&columns, ctx)?;
    printer.print_separator(ctx)?;
    for row in &rows {
        printer.print_record(row, ctx)?;
    }
    printer.print_separator(ctx)?;

    Ok(ExecuteResult::ResultSet(ResultSet { columns, rows }))
}
