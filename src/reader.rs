//! The read surface: `Reader` yields one decoded `Row` at a time from a
//! table, optionally filtered, optionally through an index.
//!
//! A reader binds a cursor to the table's root page.  Filters are
//! evaluated against the raw payload before any column is materialized;
//! an equality filter whose column leads an index is answered by probing
//! the index first and fetching matching rows by rowid.

use streaming_iterator::StreamingIterator;

use crate::btree::compare::KeyOrdering;
use crate::btree::cursor::{Cursor, SeekResult};
use crate::filter::{Filter, FilterOp, ResolvedFilter};
use crate::pager::Pager;
use crate::record;
use crate::schema::{IndexSchema, TableSchema};
use crate::sql_value::SqlValue;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Btree(#[from] crate::btree::Error),
    #[error("{0}")]
    Record(#[from] record::Error),
    #[error("{0}")]
    Filter(#[from] crate::filter::Error),
    #[error("Reader: this reader has no index bound.")]
    NoIndex,
    #[error("Reader: unknown column {0}.")]
    UnknownColumn(String),
}

/// One decoded row with positional, typed access.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    rowid: Option<i64>,
    values: Vec<SqlValue>,
}

impl Row {
    pub(crate) fn new(rowid: Option<i64>, values: Vec<SqlValue>) -> Row {
        Row { rowid, values }
    }

    /// The rowid; `None` for rows of WITHOUT ROWID tables.
    pub fn row_id(&self) -> Option<i64> {
        self.rowid
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_null(&self, i: usize) -> bool {
        matches!(self.values.get(i), Some(SqlValue::Null) | None)
    }

    pub fn get_int64(&self, i: usize) -> Option<i64> {
        self.values.get(i)?.as_int().copied()
    }

    pub fn get_double(&self, i: usize) -> Option<f64> {
        match self.values.get(i)? {
            SqlValue::Real(r) => Some(*r),
            SqlValue::Int(x) => Some(*x as f64),
            _ => None,
        }
    }

    pub fn get_string(&self, i: usize) -> Option<&str> {
        self.values.get(i)?.as_text().map(String::as_str)
    }

    pub fn get_blob(&self, i: usize) -> Option<&[u8]> {
        self.values.get(i)?.as_blob().map(Vec::as_slice)
    }

    /// All column values, in declared order.
    pub fn read(&self) -> &[SqlValue] {
        &self.values
    }
}

/// How a reader visits its rows; `explain` exposes it so callers can see
/// an index was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPath {
    TableScan,
    /// The index is probed first; matching entries fetch rows by rowid.
    IndexSeek { index: String },
}

enum Scan<'d> {
    Table {
        cursor: Cursor<'d, Pager>,
        started: bool,
    },
    /// Rows of a WITHOUT ROWID table live in an index-layout tree.
    KeyedTable {
        cursor: Cursor<'d, Pager>,
        started: bool,
    },
    IndexEq {
        index_cursor: Cursor<'d, Pager>,
        table_cursor: Cursor<'d, Pager>,
        ordering: KeyOrdering,
        probe: Vec<u8>,
        started: bool,
        exhausted: bool,
    },
}

pub struct Reader<'d> {
    pager: &'d Pager,
    table: TableSchema,
    filter: ResolvedFilter,
    scan: Scan<'d>,
    path: AccessPath,
    index: Option<IndexSchema>,
    /// Ordinals to project, in output order; `None` yields every column.
    projection: Option<Vec<usize>>,
    /// First error hit while driving the `StreamingIterator` face.
    deferred_error: Option<Error>,
    current: Option<Row>,
    /// Shared lock held for the reader's lifetime; page views must not
    /// outlive it.
    _lock: Option<crate::locks::LockGuard>,
}

impl<'d> Reader<'d> {
    pub(crate) fn new(
        pager: &'d Pager,
        table: TableSchema,
        filter: &Filter,
        indexes: &[IndexSchema],
        lock: Option<crate::locks::LockGuard>,
    ) -> Result<Reader<'d>, Error> {
        let resolved = filter.resolve(&table)?;

        // A single equality predicate on the leading column of an index
        // turns the scan into an index probe.
        let mut plan: Option<(IndexSchema, Vec<u8>)> = None;
        if !table.without_rowid {
            for p in filter.predicates.iter() {
                if p.op != FilterOp::Eq {
                    continue;
                }
                if let Some(index) = indexes
                    .iter()
                    .find(|i| i.columns.first().map(|(c, _)| c.as_str()) == Some(p.column.as_str()))
                {
                    let probe = record::encode_record(std::slice::from_ref(&p.value));
                    plan = Some((index.clone(), probe));
                    break;
                }
            }
        }

        let (scan, path, index) = match plan {
            Some((index, probe)) => (
                Scan::IndexEq {
                    index_cursor: Cursor::new(pager, index.root_page),
                    table_cursor: Cursor::new(pager, table.root_page),
                    ordering: index.key_ordering(),
                    probe,
                    started: false,
                    exhausted: false,
                },
                AccessPath::IndexSeek {
                    index: index.name.clone(),
                },
                Some(index),
            ),
            None if table.without_rowid => (
                Scan::KeyedTable {
                    cursor: Cursor::new(pager, table.root_page),
                    started: false,
                },
                AccessPath::TableScan,
                None,
            ),
            None => (
                Scan::Table {
                    cursor: Cursor::new(pager, table.root_page),
                    started: false,
                },
                AccessPath::TableScan,
                None,
            ),
        };

        Ok(Reader {
            pager,
            table,
            filter: resolved,
            scan,
            path,
            index,
            projection: None,
            deferred_error: None,
            current: None,
            _lock: lock,
        })
    }

    /// Bind an explicit index for `seek_key` point lookups.
    pub(crate) fn with_index(mut self, index: IndexSchema) -> Reader<'d> {
        self.index = Some(index);
        self
    }

    /// Restrict rows to the named columns, in the given order.
    pub(crate) fn with_columns(mut self, columns: &[&str]) -> Result<Reader<'d>, Error> {
        let mut ordinals = Vec::with_capacity(columns.len());
        for name in columns {
            ordinals.push(
                self.table
                    .column_ordinal(name)
                    .ok_or_else(|| Error::UnknownColumn(name.to_string()))?,
            );
        }
        self.projection = Some(ordinals);
        Ok(self)
    }

    /// The plan this reader will follow.
    pub fn explain(&self) -> &AccessPath {
        &self.path
    }

    fn materialize(&self, payload: &[u8], rowid: Option<i64>) -> Result<Row, Error> {
        let mut refs = Vec::new();
        record::decode_record(payload, &mut refs)?;
        let mut values: Vec<SqlValue> = refs.iter().map(|v| v.to_owned()).collect();
        // The rowid-alias column is stored as NULL; surface the rowid.
        if let (Some(ordinal), Some(rowid)) = (self.table.rowid_alias, rowid) {
            if ordinal < values.len() {
                values[ordinal] = SqlValue::Int(rowid);
            }
        }
        // Rows written by an older schema may be short; pad with NULLs.
        while values.len() < self.table.columns.len() {
            values.push(SqlValue::Null);
        }
        if let Some(ordinals) = &self.projection {
            values = ordinals.iter().map(|&i| values[i].clone()).collect();
        }
        Ok(Row::new(rowid, values))
    }

    /// The next row passing the filter, or `None` at the end.
    pub fn next_row(&mut self) -> Result<Option<Row>, Error> {
        loop {
            match &mut self.scan {
                Scan::Table { cursor, started } => {
                    if !*started {
                        cursor.first()?;
                        *started = true;
                    } else if cursor.is_valid() {
                        cursor.next()?;
                    }
                    if !cursor.is_valid() {
                        return Ok(None);
                    }
                    let rowid = cursor.rowid()?;
                    let payload = cursor.payload()?;
                    if self.filter.matches(payload, rowid)? {
                        let payload = payload.to_vec();
                        return Ok(Some(self.materialize(&payload, Some(rowid))?));
                    }
                }
                Scan::KeyedTable { cursor, started } => {
                    if !*started {
                        cursor.first()?;
                        *started = true;
                    } else if cursor.is_valid() {
                        cursor.next()?;
                    }
                    if !cursor.is_valid() {
                        return Ok(None);
                    }
                    let payload = cursor.payload()?;
                    if self.filter.matches(payload, 0)? {
                        let payload = payload.to_vec();
                        return Ok(Some(self.materialize(&payload, None)?));
                    }
                }
                Scan::IndexEq {
                    index_cursor,
                    table_cursor,
                    ordering,
                    probe,
                    started,
                    exhausted,
                } => {
                    if *exhausted {
                        return Ok(None);
                    }
                    if !*started {
                        *started = true;
                        if index_cursor.seek_key(probe, ordering)? != SeekResult::Found {
                            *exhausted = true;
                            return Ok(None);
                        }
                    } else if index_cursor.is_valid() {
                        index_cursor.next()?;
                    }
                    if !index_cursor.is_valid() {
                        *exhausted = true;
                        return Ok(None);
                    }
                    // Stop at the first entry past the probed key.
                    let entry = index_cursor.payload()?;
                    if crate::btree::compare::compare_key_records(entry, probe, ordering)?
                        != std::cmp::Ordering::Equal
                    {
                        *exhausted = true;
                        return Ok(None);
                    }
                    let mut values = Vec::new();
                    record::decode_record(entry, &mut values)?;
                    let rowid = values
                        .last()
                        .and_then(|v| v.as_int().copied())
                        .ok_or(record::Error::ColumnOutOfRange(0))?;
                    if table_cursor.seek_rowid(rowid)? != SeekResult::Found {
                        // The index points at a missing row; surface it as
                        // corruption rather than skipping silently.
                        return Err(Error::Btree(crate::btree::Error::KeyNotFound));
                    }
                    let payload = table_cursor.payload()?;
                    if self.filter.matches(payload, rowid)? {
                        let payload = payload.to_vec();
                        return Ok(Some(self.materialize(&payload, Some(rowid))?));
                    }
                }
            }
        }
    }

    /// Point lookup by rowid.
    pub fn seek(&mut self, rowid: i64) -> Result<Option<Row>, Error> {
        let mut cursor = Cursor::new(self.pager, self.table.root_page);
        if cursor.seek_rowid(rowid)? != SeekResult::Found {
            return Ok(None);
        }
        let payload = cursor.payload()?.to_vec();
        Ok(Some(self.materialize(&payload, Some(rowid))?))
    }

    /// Point lookup through the bound index: the first row whose index key
    /// starts with `key`.
    pub fn seek_key(&mut self, key: &[SqlValue]) -> Result<Option<Row>, Error> {
        let index = self.index.as_ref().ok_or(Error::NoIndex)?;
        let ordering = index.key_ordering();
        let probe = record::encode_record(key);
        let mut index_cursor = Cursor::new(self.pager, index.root_page);
        if index_cursor.seek_key(&probe, &ordering)? != SeekResult::Found {
            return Ok(None);
        }
        let entry = index_cursor.payload()?;
        let mut values = Vec::new();
        record::decode_record(entry, &mut values)?;
        let rowid = values
            .last()
            .and_then(|v| v.as_int().copied())
            .ok_or(record::Error::ColumnOutOfRange(0))?;
        drop(values);
        self.seek(rowid)
    }

    /// The first error swallowed by the `StreamingIterator` face, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.deferred_error.take()
    }
}

/// Streaming iteration borrows each row in place; errors are parked for
/// `take_error` since the trait has no failure channel.
impl<'d> StreamingIterator for Reader<'d> {
    type Item = Row;

    fn advance(&mut self) {
        if self.deferred_error.is_some() {
            self.current = None;
            return;
        }
        match self.next_row() {
            Ok(row) => self.current = row,
            Err(e) => {
                self.deferred_error = Some(e);
                self.current = None;
            }
        }
    }

    fn get(&self) -> Option<&Row> {
        self.current.as_ref()
    }
}
