//! Predicate pushdown over the candidate `(database, table)` relation.
//!
//! The filter only sees the cheap name columns. Conditions on any other
//! column cannot be decided here and are treated as unknown, which keeps
//! the row; the result may contain extra rows but never drops one that
//! could match.

use std::collections::BTreeSet;
use std::sync::Arc;

use arrow::compute::kernels::boolean::{and, not, or};
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::{cast, like, nlike};
use arrow_array::{Array, ArrayRef, BooleanArray, RecordBatch, Scalar, StringArray};
use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    /// Operator with its operands swapped (`'a' < x` is `x > 'a'`).
    pub fn flip(self) -> Self {
        match self {
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::NotEq => CompareOp::NotEq,
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::GtEq => CompareOp::LtEq,
        }
    }
}

/// Filter expression of a system table query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    True,
    Compare {
        column: String,
        op: CompareOp,
        value: String,
    },
    In {
        column: String,
        values: Vec<String>,
        negated: bool,
    },
    Like {
        column: String,
        pattern: String,
        negated: bool,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(column: &str, value: &str) -> Self {
        Predicate::Compare {
            column: column.to_string(),
            op: CompareOp::Eq,
            value: value.to_string(),
        }
    }

    pub fn in_list<S: AsRef<str>>(column: &str, values: &[S]) -> Self {
        Predicate::In {
            column: column.to_string(),
            values: values.iter().map(|v| v.as_ref().to_string()).collect(),
            negated: false,
        }
    }

    pub fn like(column: &str, pattern: &str) -> Self {
        Predicate::Like {
            column: column.to_string(),
            pattern: pattern.to_string(),
            negated: false,
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Every column name the predicate refers to.
    pub fn columns(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::True => {}
            Predicate::Compare { column, .. }
            | Predicate::In { column, .. }
            | Predicate::Like { column, .. } => {
                out.insert(column.as_str());
            }
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Predicate::Not(p) => p.collect_columns(out),
        }
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::True
    }
}

/// Evaluates a predicate against a small relation of key columns.
pub trait PushdownFilter: Send + Sync {
    /// Indices of the rows of `relation` that may satisfy `predicate`,
    /// strictly ascending.
    fn filter(
        &self,
        relation: &RecordBatch,
        predicate: &Predicate,
    ) -> Result<Vec<usize>, EngineError>;
}

/// Default filter built on Arrow compute kernels.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrowPushdownFilter;

impl PushdownFilter for ArrowPushdownFilter {
    fn filter(
        &self,
        relation: &RecordBatch,
        predicate: &Predicate,
    ) -> Result<Vec<usize>, EngineError> {
        let n = relation.num_rows();
        match evaluate(relation, predicate, false)? {
            None => Ok((0..n).collect()),
            Some(mask) => Ok(mask
                .iter()
                .enumerate()
                .filter_map(|(i, keep)| (keep == Some(true)).then_some(i))
                .collect()),
        }
    }
}

/// Exact mask of `predicate` over `batch`. Every referenced column must be
/// present; literals are converted to the column type.
pub fn predicate_mask(
    batch: &RecordBatch,
    predicate: &Predicate,
) -> Result<BooleanArray, EngineError> {
    if let Some(missing) = predicate
        .columns()
        .into_iter()
        .find(|c| batch.schema().index_of(c).is_err())
    {
        return Err(EngineError::UnknownColumn(missing.to_string()));
    }
    evaluate(batch, predicate, true)?
        .ok_or_else(|| EngineError::Internal("predicate left undecided".into()))
}

fn literal_scalar(column: &ArrayRef, value: &str) -> Result<Scalar<ArrayRef>, EngineError> {
    let literal: ArrayRef = Arc::new(StringArray::from(vec![value]));
    match column.data_type() {
        DataType::Utf8 => Ok(Scalar::new(literal)),
        DataType::List(_) => Err(EngineError::InvalidPredicate(format!(
            "cannot compare an array column with '{value}'"
        ))),
        target => {
            let converted = cast(&literal, target)?;
            if converted.is_null(0) {
                return Err(EngineError::InvalidPredicate(format!(
                    "cannot convert '{value}' to {target}"
                )));
            }
            Ok(Scalar::new(converted))
        }
    }
}

/// `None` means the predicate cannot be decided on this relation. With
/// `exact`, a conjunction is only decided when both sides are; under `NOT`
/// evaluation is always exact.
fn evaluate(
    batch: &RecordBatch,
    predicate: &Predicate,
    exact: bool,
) -> Result<Option<BooleanArray>, EngineError> {
    let n = batch.num_rows();
    let mask = match predicate {
        Predicate::True => Some(BooleanArray::from(vec![true; n])),
        Predicate::Compare { column, op, value } => {
            let Some(idx) = batch.schema().index_of(column).ok() else {
                return Ok(None);
            };
            let col = batch.column(idx);
            let scalar = literal_scalar(col, value)?;
            let mask = match op {
                CompareOp::Eq => eq(col, &scalar)?,
                CompareOp::NotEq => neq(col, &scalar)?,
                CompareOp::Lt => lt(col, &scalar)?,
                CompareOp::LtEq => lt_eq(col, &scalar)?,
                CompareOp::Gt => gt(col, &scalar)?,
                CompareOp::GtEq => gt_eq(col, &scalar)?,
            };
            Some(mask)
        }
        Predicate::In {
            column,
            values,
            negated,
        } => {
            let Some(idx) = batch.schema().index_of(column).ok() else {
                return Ok(None);
            };
            let col = batch.column(idx);
            let mut in_mask = BooleanArray::from(vec![false; n]);
            for value in values {
                let matches = eq(col, &literal_scalar(col, value)?)?;
                in_mask = or(&in_mask, &matches)?;
            }
            Some(if *negated { not(&in_mask)? } else { in_mask })
        }
        Predicate::Like {
            column,
            pattern,
            negated,
        } => {
            let Some(idx) = batch.schema().index_of(column).ok() else {
                return Ok(None);
            };
            let col = batch.column(idx);
            if col.data_type() != &DataType::Utf8 {
                return Err(EngineError::InvalidPredicate(format!(
                    "LIKE needs a string column, {column} is {}",
                    col.data_type()
                )));
            }
            let scalar = StringArray::new_scalar(pattern.as_str());
            Some(if *negated {
                nlike(col, &scalar)?
            } else {
                like(col, &scalar)?
            })
        }
        Predicate::And(a, b) => match (evaluate(batch, a, exact)?, evaluate(batch, b, exact)?) {
            (Some(a), Some(b)) => Some(and(&a, &b)?),
            // An undecidable conjunct is dropped.
            (Some(m), None) | (None, Some(m)) if !exact => Some(m),
            _ => None,
        },
        Predicate::Or(a, b) => match (evaluate(batch, a, exact)?, evaluate(batch, b, exact)?) {
            (Some(a), Some(b)) => Some(or(&a, &b)?),
            _ => None,
        },
        Predicate::Not(p) => match evaluate(batch, p, true)? {
            Some(m) => Some(not(&m)?),
            None => None,
        },
    };
    Ok(mask)
}
