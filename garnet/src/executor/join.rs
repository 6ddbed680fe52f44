//! Nested-loop join and projection over the scan executors.

use basalt::record::Record;
use basalt::Rid;

use super::eval::eval_conds;
use super::QueryExecutor;
use crate::catalog::{ColMeta, TabMeta};
use crate::errors::DbResult;
use crate::value::Condition;

/// Joins an outer stream against a materialized inner side; the inner
/// rows are rewound for every outer row.
pub struct NestedLoopJoinExecutor<'a> {
    outer: Box<QueryExecutor<'a>>,
    inner_rows: Vec<Record>,
    schema: TabMeta,
    join_conds: Vec<Condition>,
    current_outer: Option<Record>,
    inner_pos: usize,
}

/// Concatenates two schemas, shifting the right side's offsets.
fn merge_schemas(left: &TabMeta, right: &TabMeta) -> TabMeta {
    let left_width = left.record_size();
    let mut cols: Vec<ColMeta> = left.cols.clone();
    cols.extend(right.cols.iter().map(|col| ColMeta {
        offset: col.offset + left_width,
        ..col.clone()
    }));
    TabMeta {
        name: format!("{}_{}", left.name, right.name),
        cols,
        indexes: Vec::new(),
    }
}

impl<'a> NestedLoopJoinExecutor<'a> {
    pub fn new(
        outer: QueryExecutor<'a>,
        mut inner: QueryExecutor<'a>,
        join_conds: Vec<Condition>,
    ) -> DbResult<Self> {
        let schema = merge_schemas(outer.schema(), inner.schema());
        let mut inner_rows = Vec::new();
        while let Some((_, record)) = inner.next()? {
            inner_rows.push(record);
        }
        Ok(Self {
            outer: Box::new(outer),
            inner_rows,
            schema,
            join_conds,
            current_outer: None,
            inner_pos: 0,
        })
    }

    pub fn schema(&self) -> &TabMeta {
        &self.schema
    }

    pub fn next(&mut self) -> DbResult<Option<(Rid, Record)>> {
        loop {
            if self.current_outer.is_none() {
                match self.outer.next()? {
                    Some((_, record)) => {
                        self.current_outer = Some(record);
                        self.inner_pos = 0;
                    }
                    None => return Ok(None),
                }
            }

            let outer = self.current_outer.as_ref().unwrap();
            while self.inner_pos < self.inner_rows.len() {
                let inner = &self.inner_rows[self.inner_pos];
                self.inner_pos += 1;

                let mut data = outer.data.clone();
                data.extend_from_slice(&inner.data);
                if eval_conds(&self.schema, &self.join_conds, &data)? {
                    return Ok(Some((Rid::invalid(), Record { data })));
                }
            }
            self.current_outer = None;
        }
    }
}

/// Re-lays rows out over a column subset.
pub struct ProjectionExecutor<'a> {
    input: Box<QueryExecutor<'a>>,
    schema: TabMeta,
    /// `(offset, len)` of each projected column in the input layout.
    src_segments: Vec<(usize, usize)>,
}

impl<'a> ProjectionExecutor<'a> {
    pub fn new(input: QueryExecutor<'a>, col_names: &[String]) -> DbResult<Self> {
        let mut cols = Vec::with_capacity(col_names.len());
        let mut src_segments = Vec::with_capacity(col_names.len());
        let mut offset = 0;
        for name in col_names {
            let src = input.schema().get_col(name)?;
            src_segments.push((src.offset, src.len));
            cols.push(ColMeta {
                offset,
                ..src.clone()
            });
            offset += src.len;
        }
        let schema = TabMeta {
            name: input.schema().name.clone(),
            cols,
            indexes: Vec::new(),
        };
        Ok(Self {
            input: Box::new(input),
            schema,
            src_segments,
        })
    }

    pub fn schema(&self) -> &TabMeta {
        &self.schema
    }

    pub fn next(&mut self) -> DbResult<Option<(Rid, Record)>> {
        let Some((rid, record)) = self.input.next()? else {
            return Ok(None);
        };
        let mut data = Vec::with_capacity(self.schema.record_size());
        for &(offset, len) in &self.src_segments {
            data.extend_from_slice(&record.data[offset..offset + len]);
        }
        Ok(Some((rid, Record { data })))
    }
}
