// Expression Evaluation
//
// Scalar expressions evaluated against a single row; used by filters and
// post-processing. Comparisons follow SQL three-valued logic: any comparison
// involving NULL yields NULL, and a filter keeps a row only on TRUE.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::exec::error::{FlowError, Result};
use crate::exec::row::{DataValue, Row};

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::NotEq => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::LtEq => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::GtEq => ord != Ordering::Less,
        }
    }
}

/// A scalar expression over the columns of one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Column reference by ordinal
    Column(usize),
    Const(DataValue),
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
}

impl Expr {
    pub fn col(idx: usize) -> Self {
        Expr::Column(idx)
    }

    pub fn int(v: i64) -> Self {
        Expr::Const(DataValue::Integer(v))
    }

    pub fn cmp(op: CmpOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Expr::Or(Box::new(left), Box::new(right))
    }

    pub fn not(inner: Expr) -> Self {
        Expr::Not(Box::new(inner))
    }

    pub fn is_null(inner: Expr) -> Self {
        Expr::IsNull(Box::new(inner))
    }

    /// Evaluate the expression against a row
    pub fn eval(&self, row: &Row) -> Result<DataValue> {
        match self {
            Expr::Column(idx) => row.get(*idx).cloned().ok_or(FlowError::ColumnOutOfRange {
                index: *idx,
                width: row.len(),
            }),
            Expr::Const(v) => Ok(v.clone()),
            Expr::Compare { op, left, right } => {
                let l = left.eval(row)?;
                let r = right.eval(row)?;
                if l.is_null() || r.is_null() {
                    return Ok(DataValue::Null);
                }
                match l.partial_cmp(&r) {
                    Some(ord) => Ok(DataValue::Boolean(op.holds(ord))),
                    None => Err(FlowError::TypeError(format!("cannot compare {} with {}", l, r))),
                }
            }
            Expr::And(left, right) => {
                let l = eval_bool(left, row)?;
                if l == Some(false) {
                    return Ok(DataValue::Boolean(false));
                }
                match (l, eval_bool(right, row)?) {
                    (_, Some(false)) => Ok(DataValue::Boolean(false)),
                    (Some(true), Some(true)) => Ok(DataValue::Boolean(true)),
                    _ => Ok(DataValue::Null),
                }
            }
            Expr::Or(left, right) => {
                let l = eval_bool(left, row)?;
                if l == Some(true) {
                    return Ok(DataValue::Boolean(true));
                }
                match (l, eval_bool(right, row)?) {
                    (_, Some(true)) => Ok(DataValue::Boolean(true)),
                    (Some(false), Some(false)) => Ok(DataValue::Boolean(false)),
                    _ => Ok(DataValue::Null),
                }
            }
            Expr::Not(inner) => Ok(match eval_bool(inner, row)? {
                Some(b) => DataValue::Boolean(!b),
                None => DataValue::Null,
            }),
            Expr::IsNull(inner) => Ok(DataValue::Boolean(inner.eval(row)?.is_null())),
        }
    }

    /// Evaluate as a filter predicate: only TRUE passes
    pub fn passes(&self, row: &Row) -> Result<bool> {
        Ok(eval_bool(self, row)? == Some(true))
    }
}

/// Evaluate to a nullable boolean; non-boolean results are a type error
fn eval_bool(expr: &Expr, row: &Row) -> Result<Option<bool>> {
    match expr.eval(row)? {
        DataValue::Null => Ok(None),
        DataValue::Boolean(b) => Ok(Some(b)),
        other => Err(FlowError::TypeError(format!("expected boolean, got {}", other))),
    }
}
