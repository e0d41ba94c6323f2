//! Minimal obs row predicates.
//!
//! Values are compared as strings after casting the column to Utf8, so
//! `ObsQuery::eq("n_genes", "120")` works on integer columns too. Nulls never match.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Scalar, StringArray, UInt64Array};
use arrow::compute::cast;
use arrow::compute::kernels::boolean::{and_kleene, not, or_kleene};
use arrow::compute::kernels::cmp::{eq, neq};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use hashbrown::HashSet;
use indexmap::IndexSet;

use crate::error::{SliceError, StoreError};
use crate::store::JOIN_ID_COLUMN;

/// Predicate over obs rows.
#[derive(Debug, Clone, PartialEq)]
pub enum ObsQuery {
    Eq(String, String),
    NotEq(String, String),
    In(String, Vec<String>),
    /// Rows whose `soma_joinid` is one of the given identifiers.
    ///
    /// The set is built once and shared by every clone of the query.
    JoinIds(Arc<HashSet<u64>>),
    And(Box<ObsQuery>, Box<ObsQuery>),
    Or(Box<ObsQuery>, Box<ObsQuery>),
    Not(Box<ObsQuery>),
}

impl ObsQuery {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        ObsQuery::Eq(column.into(), value.into())
    }

    pub fn not_eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        ObsQuery::NotEq(column.into(), value.into())
    }

    pub fn is_in<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ObsQuery::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn join_ids(ids: impl IntoIterator<Item = u64>) -> Self {
        ObsQuery::JoinIds(Arc::new(ids.into_iter().collect()))
    }

    pub fn and(self, other: ObsQuery) -> Self {
        ObsQuery::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: ObsQuery) -> Self {
        ObsQuery::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        ObsQuery::Not(Box::new(self))
    }

    /// Columns the predicate reads, in first-use order.
    pub fn columns(&self) -> Vec<String> {
        let mut out = IndexSet::new();
        self.collect_columns(&mut out);
        out.into_iter().collect()
    }

    fn collect_columns(&self, out: &mut IndexSet<String>) {
        match self {
            ObsQuery::Eq(c, _) | ObsQuery::NotEq(c, _) | ObsQuery::In(c, _) => {
                out.insert(c.clone());
            }
            ObsQuery::JoinIds(_) => {
                out.insert(JOIN_ID_COLUMN.to_string());
            }
            ObsQuery::And(a, b) | ObsQuery::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            ObsQuery::Not(inner) => inner.collect_columns(out),
        }
    }

    /// Evaluates the predicate against a page, one mask entry per row.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray, StoreError> {
        match self {
            ObsQuery::Eq(column, value) => {
                let strings = string_column(batch, column)?;
                Ok(eq(&strings, &Scalar::new(StringArray::from(vec![value.as_str()])))?)
            }
            ObsQuery::NotEq(column, value) => {
                let strings = string_column(batch, column)?;
                Ok(neq(&strings, &Scalar::new(StringArray::from(vec![value.as_str()])))?)
            }
            ObsQuery::In(column, values) => {
                let strings = string_column(batch, column)?;
                let wanted: HashSet<&str> = values.iter().map(String::as_str).collect();
                let strings = strings
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| StoreError::malformed(format!("column '{}' did not cast to Utf8", column)))?;
                Ok(strings.iter().map(|v| v.map(|s| wanted.contains(s))).collect())
            }
            ObsQuery::JoinIds(ids) => {
                let column = lookup(batch, JOIN_ID_COLUMN)?;
                let as_u64 = cast(column, &DataType::UInt64)?;
                let as_u64 = as_u64
                    .as_any()
                    .downcast_ref::<UInt64Array>()
                    .ok_or_else(|| StoreError::malformed("soma_joinid did not cast to UInt64"))?;
                Ok(as_u64.iter().map(|v| v.map(|id| ids.contains(&id))).collect())
            }
            ObsQuery::And(a, b) => Ok(and_kleene(&a.evaluate(batch)?, &b.evaluate(batch)?)?),
            ObsQuery::Or(a, b) => Ok(or_kleene(&a.evaluate(batch)?, &b.evaluate(batch)?)?),
            ObsQuery::Not(inner) => Ok(not(&inner.evaluate(batch)?)?),
        }
    }

    /// Parses the command-line form: comma-separated terms, AND-ed together.
    ///
    /// Terms are `col=value`, `col!=value`, or `col=a|b|c` for set membership.
    pub fn parse(text: &str) -> Result<Self, SliceError> {
        let mut terms = Vec::new();
        for raw in text.split(',') {
            let term = raw.trim();
            if term.is_empty() {
                continue;
            }
            let parsed = if let Some((col, value)) = term.split_once("!=") {
                ObsQuery::not_eq(non_empty(col, term)?, value.trim())
            } else if let Some((col, value)) = term.split_once('=') {
                let col = non_empty(col, term)?;
                if value.contains('|') {
                    ObsQuery::is_in(col, value.split('|').map(str::trim))
                } else {
                    ObsQuery::eq(col, value.trim())
                }
            } else {
                return Err(SliceError::config(format!(
                    "cannot parse query term '{}' (expected col=value, col!=value or col=a|b)",
                    term
                )));
            };
            terms.push(parsed);
        }

        terms
            .into_iter()
            .reduce(ObsQuery::and)
            .ok_or_else(|| SliceError::config("empty query"))
    }
}

fn non_empty<'a>(col: &'a str, term: &str) -> Result<&'a str, SliceError> {
    let col = col.trim();
    if col.is_empty() {
        return Err(SliceError::config(format!("missing column name in '{}'", term)));
    }
    Ok(col)
}

fn lookup<'a>(batch: &'a RecordBatch, column: &str) -> Result<&'a ArrayRef, StoreError> {
    batch.column_by_name(column).ok_or_else(|| StoreError::UnknownColumn {
        column: column.to_string(),
        available: batch.schema().fields().iter().map(|f| f.name().clone()).collect(),
    })
}

fn string_column(batch: &RecordBatch, column: &str) -> Result<ArrayRef, StoreError> {
    let array = lookup(batch, column)?;
    if array.data_type() == &DataType::Utf8 {
        return Ok(Arc::clone(array));
    }
    Ok(cast(array, &DataType::Utf8)?)
}
