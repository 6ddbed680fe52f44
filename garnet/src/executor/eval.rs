//! Condition evaluation over packed tuples.

use std::cmp::Ordering;

use basalt::index::{compare_col, ColType};

use crate::catalog::TabMeta;
use crate::errors::{DbError, DbResult};
use crate::value::{CompOp, CondRhs, Condition};

/// Byte-compares two column segments that may differ in width
/// (column-to-column string comparisons); the shorter operand loses a
/// tie over the common prefix unless its remainder is padding.
fn compare_segments(
    lhs: &[u8],
    lhs_len: usize,
    rhs: &[u8],
    rhs_len: usize,
    ty: ColType,
) -> Ordering {
    let len = lhs_len.min(rhs_len);
    let ord = compare_col(lhs, rhs, ty, len);
    if ord != Ordering::Equal || lhs_len == rhs_len || ty != ColType::Str {
        return ord;
    }
    let (longer, longer_len, flip) = if lhs_len > rhs_len {
        (lhs, lhs_len, false)
    } else {
        (rhs, rhs_len, true)
    };
    let has_tail = longer[len..longer_len].iter().any(|&b| b != 0);
    match (has_tail, flip) {
        (false, _) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (true, true) => Ordering::Less,
    }
}

fn eval_cond(tab: &TabMeta, cond: &Condition, data: &[u8]) -> DbResult<bool> {
    let lhs_col = tab.get_col(&cond.col)?;
    let lhs = &data[lhs_col.offset..lhs_col.offset + lhs_col.len];

    let ord = match &cond.rhs {
        CondRhs::Value(value) => {
            let rhs = value.to_bytes(lhs_col.ty, lhs_col.len)?;
            compare_col(lhs, &rhs, lhs_col.ty, lhs_col.len)
        }
        CondRhs::Col(rhs_name) => {
            let rhs_col = tab.get_col(rhs_name)?;
            if rhs_col.ty != lhs_col.ty {
                return Err(DbError::IncompatibleType {
                    expected: format!("{:?}", lhs_col.ty),
                    got: format!("{:?}", rhs_col.ty),
                });
            }
            let rhs = &data[rhs_col.offset..rhs_col.offset + rhs_col.len];
            compare_segments(lhs, lhs_col.len, rhs, rhs_col.len, lhs_col.ty)
        }
    };

    Ok(match cond.op {
        CompOp::Eq => ord == Ordering::Equal,
        CompOp::Ne => ord != Ordering::Equal,
        CompOp::Lt => ord == Ordering::Less,
        CompOp::Gt => ord == Ordering::Greater,
        CompOp::Le => ord != Ordering::Greater,
        CompOp::Ge => ord != Ordering::Less,
    })
}

/// True when the tuple satisfies every conjunct.
pub fn eval_conds(tab: &TabMeta, conds: &[Condition], data: &[u8]) -> DbResult<bool> {
    for cond in conds {
        if !eval_cond(tab, cond, data)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{build_table_meta, ColDef};
    use crate::value::Value;

    fn tab() -> TabMeta {
        build_table_meta(
            "t",
            &[
                ColDef {
                    name: "a".into(),
                    ty: ColType::Int,
                    len: 4,
                },
                ColDef {
                    name: "b".into(),
                    ty: ColType::Int,
                    len: 4,
                },
                ColDef {
                    name: "s".into(),
                    ty: ColType::Str,
                    len: 4,
                },
            ],
        )
        .unwrap()
    }

    fn row(a: i32, b: i32, s: &[u8; 4]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&a.to_le_bytes());
        data.extend_from_slice(&b.to_le_bytes());
        data.extend_from_slice(s);
        data
    }

    #[test]
    fn value_comparisons_cover_all_operators() {
        let tab = tab();
        let data = row(5, 9, b"cd\0\0");
        let check = |op, v: i32| {
            eval_cond(&tab, &Condition::with_value("a", op, Value::Int(v)), &data).unwrap()
        };
        assert!(check(CompOp::Eq, 5));
        assert!(check(CompOp::Ne, 6));
        assert!(check(CompOp::Lt, 6));
        assert!(check(CompOp::Gt, 4));
        assert!(check(CompOp::Le, 5));
        assert!(check(CompOp::Ge, 5));
        assert!(!check(CompOp::Gt, 5));
    }

    #[test]
    fn column_to_column_comparison() {
        let tab = tab();
        assert!(eval_cond(
            &tab,
            &Condition::with_col("a", CompOp::Lt, "b"),
            &row(5, 9, b"x\0\0\0")
        )
        .unwrap());
        assert!(eval_cond(
            &tab,
            &Condition::with_col("a", CompOp::Eq, "b"),
            &row(7, 7, b"x\0\0\0")
        )
        .unwrap());
    }

    #[test]
    fn conjunction_requires_every_cond() {
        let tab = tab();
        let data = row(5, 9, b"cd\0\0");
        let conds = vec![
            Condition::with_value("a", CompOp::Eq, Value::Int(5)),
            Condition::with_value("s", CompOp::Eq, Value::Str("cd".into())),
        ];
        assert!(eval_conds(&tab, &conds, &data).unwrap());

        let conds = vec![
            Condition::with_value("a", CompOp::Eq, Value::Int(5)),
            Condition::with_value("b", CompOp::Lt, Value::Int(9)),
        ];
        assert!(!eval_conds(&tab, &conds, &data).unwrap());
    }

    #[test]
    fn type_mismatch_between_columns_errors() {
        let tab = tab();
        assert!(matches!(
            eval_cond(
                &tab,
                &Condition::with_col("a", CompOp::Eq, "s"),
                &row(1, 2, b"ab\0\0")
            ),
            Err(DbError::IncompatibleType { .. })
        ));
    }
}
