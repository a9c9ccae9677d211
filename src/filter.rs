//! Row filters: an AND-list of single-column comparisons, evaluated
//! against the raw record so that columns a predicate does not touch are
//! never materialized.

use std::cmp::Ordering;

use crate::btree::compare::compare_values;
use crate::record;
use crate::schema::TableSchema;
use crate::sql_value::{SqlValue, ValueRef};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Filter references unknown column {0}.")]
    UnknownColumn(String),
    #[error("{0}")]
    Record(#[from] record::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    fn matches(self, ord: Ordering) -> bool {
        match self {
            FilterOp::Eq => ord == Ordering::Equal,
            FilterOp::Ne => ord != Ordering::Equal,
            FilterOp::Lt => ord == Ordering::Less,
            FilterOp::Le => ord != Ordering::Greater,
            FilterOp::Gt => ord == Ordering::Greater,
            FilterOp::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub op: FilterOp,
    pub value: SqlValue,
}

/// All predicates must hold (an AND-tree flattened to a list).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub predicates: Vec<Predicate>,
}

impl Filter {
    pub fn new() -> Filter {
        Filter::default()
    }

    pub fn and(mut self, column: &str, op: FilterOp, value: impl Into<SqlValue>) -> Filter {
        self.predicates.push(Predicate {
            column: column.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    /// Shorthand for the common equality filter.
    pub fn eq(column: &str, value: impl Into<SqlValue>) -> Filter {
        Filter::new().and(column, FilterOp::Eq, value)
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Bind column names to record ordinals for `table`.
    pub(crate) fn resolve(&self, table: &TableSchema) -> Result<ResolvedFilter, Error> {
        let mut predicates = Vec::with_capacity(self.predicates.len());
        for p in &self.predicates {
            let ordinal = table
                .column_ordinal(&p.column)
                .ok_or_else(|| Error::UnknownColumn(p.column.clone()))?;
            predicates.push(ResolvedPredicate {
                ordinal,
                is_rowid_alias: table.rowid_alias == Some(ordinal),
                op: p.op,
                value: p.value.clone(),
            });
        }
        Ok(ResolvedFilter { predicates })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedPredicate {
    pub ordinal: usize,
    pub is_rowid_alias: bool,
    pub op: FilterOp,
    pub value: SqlValue,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ResolvedFilter {
    pub predicates: Vec<ResolvedPredicate>,
}

impl ResolvedFilter {
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Evaluate against a raw record payload.  A comparison with NULL on
    /// either side never matches.
    pub fn matches(&self, payload: &[u8], rowid: i64) -> Result<bool, Error> {
        if self.predicates.is_empty() {
            return Ok(true);
        }
        let mut serial_types = Vec::new();
        let body_offset = record::read_serial_types(payload, &mut serial_types)?;
        for p in &self.predicates {
            let stored: ValueRef = if p.is_rowid_alias {
                ValueRef::Int(rowid)
            } else if p.ordinal < serial_types.len() {
                record::decode_column(payload, p.ordinal, &serial_types, body_offset)?
            } else {
                ValueRef::Null
            };
            let probe = ValueRef::from(&p.value);
            if matches!(stored, ValueRef::Null) || matches!(probe, ValueRef::Null) {
                return Ok(false);
            }
            if !p.op.matches(compare_values(&stored, &probe)) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
