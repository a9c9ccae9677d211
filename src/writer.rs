//! The single-writer transaction layer.
//!
//! A `Transaction` holds the database's exclusive lock from
//! `begin_transaction` until `commit` or `rollback`.  Mutations stage in
//! the shadow overlay; pre-images reach the rollback journal before any
//! page is dirtied, and the commit writes the journal durable, flushes the
//! dirty pages, and deletes the journal -- whose absence is the commit
//! witness.  Any mutation error leaves the transaction poisoned: only
//! `rollback` is legal afterwards.

use std::collections::HashMap;

use log::debug;

use crate::ast::DdlStatement;
use crate::btree::compare::KeyOrdering;
use crate::btree::cursor::Cursor;
use crate::btree::mutator::Mutator;
use crate::dbheader::{self, DbfileHeader};
use crate::filter::Filter;
use crate::freelist::Freelist;
use crate::locks::LockGuard;
use crate::pt_to_ast::parse_ddl_statement;
use crate::record::{decode_record, encode_record, encode_record_refs};
use crate::schema::{self, Schema, TableSchema, SCHEMA_BTREE_ROOT_PAGENUM};
use crate::shadow::ShadowPageSource;
use crate::sql_value::{SqlValue, ValueRef};
use crate::Error;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction: the database is open read-only.")]
    ReadOnly,
    #[error("Transaction: this transaction has already finished.")]
    Finished,
    #[error("Transaction: a mutation failed; only rollback is legal now.")]
    RollbackOnly,
    #[error("Transaction: a rollback journal needs recovery but the database is read-only.")]
    HotJournal,
}

pub struct Transaction<'db> {
    db_schema: &'db mut Schema,
    /// Working catalog: DDL applies here first and replaces the
    /// database's copy at commit.
    schema: Schema,
    shadow: Option<ShadowPageSource<'db>>,
    freelist: Freelist,
    header: DbfileHeader,
    ddl_ran: bool,
    poisoned: bool,
    /// Highest rowid handed out per table, so a rowid freed by a delete is
    /// not reissued within this transaction.
    rowid_floor: HashMap<String, i64>,
    /// The database's view of the header change counter, advanced at
    /// commit.
    change_counter: &'db std::cell::Cell<u32>,
    _lock: LockGuard,
}

impl<'db> std::fmt::Debug for Transaction<'db> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("ddl_ran", &self.ddl_ran)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl<'db> Transaction<'db> {
    pub(crate) fn begin(
        db_schema: &'db mut Schema,
        shadow: ShadowPageSource<'db>,
        header: DbfileHeader,
        lock: LockGuard,
        change_counter: &'db std::cell::Cell<u32>,
    ) -> Transaction<'db> {
        let schema = db_schema.clone();
        let freelist = Freelist::new(header.freelist_head, header.freelist_count);
        Transaction {
            db_schema,
            schema,
            shadow: Some(shadow),
            freelist,
            header,
            ddl_ran: false,
            poisoned: false,
            rowid_floor: HashMap::new(),
            change_counter,
            _lock: lock,
        }
    }

    /// The transaction's view of the catalog (DDL included).
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn check_active(&self) -> Result<(), Error> {
        if self.shadow.is_none() {
            return Err(TransactionError::Finished.into());
        }
        if self.poisoned {
            return Err(TransactionError::RollbackOnly.into());
        }
        Ok(())
    }

    fn poisoning<T>(&mut self, r: Result<T, Error>) -> Result<T, Error> {
        if r.is_err() {
            self.poisoned = true;
        }
        r
    }

    // ------------------------------------------------------------------
    // Row verbs
    // ------------------------------------------------------------------

    /// Insert a row; returns the assigned rowid (0 for WITHOUT ROWID
    /// tables).  Pass `SqlValue::Null` for an `INTEGER PRIMARY KEY` column
    /// to have the rowid assigned.
    pub fn insert(&mut self, table: &str, values: &[SqlValue]) -> Result<i64, Error> {
        self.check_active()?;
        let r = self.insert_inner(table, values, None);
        self.poisoning(r)
    }

    /// Insert with an explicit rowid, replacing an existing row.
    pub fn upsert(&mut self, table: &str, rowid: i64, values: &[SqlValue]) -> Result<(), Error> {
        self.check_active()?;
        let r = (|| {
            let exists = {
                let t = self.table_schema(table)?;
                let shadow = self.shadow.as_ref().expect("checked active");
                let mut cursor = Cursor::new(shadow, t.root_page);
                cursor.seek_rowid(rowid)? == crate::btree::cursor::SeekResult::Found
            };
            if exists {
                self.update_inner(table, rowid, values)
            } else {
                self.insert_inner(table, values, Some(rowid)).map(|_| ())
            }
        })();
        self.poisoning(r)
    }

    /// Replace an existing row's columns.
    pub fn update(&mut self, table: &str, rowid: i64, values: &[SqlValue]) -> Result<(), Error> {
        self.check_active()?;
        let r = self.update_inner(table, rowid, values);
        self.poisoning(r)
    }

    /// Delete every row matching `filter`; returns how many went.
    pub fn delete_where(&mut self, table: &str, filter: &Filter) -> Result<usize, Error> {
        self.check_active()?;
        let r = self.delete_where_inner(table, filter);
        self.poisoning(r)
    }

    /// Execute one DDL statement (`CREATE TABLE`, `CREATE [UNIQUE] INDEX`,
    /// `CREATE VIEW`, `DROP TABLE`, `DROP INDEX`).
    pub fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.check_active()?;
        let r = self.execute_inner(sql);
        self.poisoning(r)
    }

    // ------------------------------------------------------------------
    // Commit / rollback
    // ------------------------------------------------------------------

    /// Publish the transaction: journal durable, dirty pages written,
    /// device flushed, journal deleted, lock released.
    pub fn commit(mut self) -> Result<(), Error> {
        self.check_active()?;
        let mut shadow = self.shadow.take().expect("checked active");

        // Patch the header on page 1 inside the shadow so the change is
        // journaled with everything else.
        let new_change_counter = self.header.changecnt.wrapping_add(1);
        let page_count = shadow.page_count();
        let page1 = shadow.page_mut(1)?;
        dbheader::patch_u32(page1, dbheader::OFFSET_CHANGE_COUNTER, new_change_counter);
        dbheader::patch_u32(page1, dbheader::OFFSET_VERSION_VALID_FOR, new_change_counter);
        dbheader::patch_u32(page1, dbheader::OFFSET_PAGE_COUNT, page_count);
        dbheader::patch_u32(page1, dbheader::OFFSET_FREELIST_HEAD, self.freelist.head);
        dbheader::patch_u32(page1, dbheader::OFFSET_FREELIST_COUNT, self.freelist.count);
        if self.ddl_ran {
            dbheader::patch_u32(
                page1,
                dbheader::OFFSET_SCHEMA_COOKIE,
                self.header.schema_cookie.wrapping_add(1),
            );
        }

        debug!(
            "commit: {} dirty page(s), page count {} -> {}",
            shadow.dirty_page_count(),
            self.header.numpages,
            page_count
        );
        let journal = shadow.flush_to_pager()?;
        journal.delete()?;
        *self.db_schema = std::mem::take(&mut self.schema);
        self.change_counter.set(new_change_counter);
        Ok(())
    }

    /// Abandon the transaction: nothing reached the file, so dropping the
    /// shadow map and deleting the journal restores the world.
    pub fn rollback(mut self) -> Result<(), Error> {
        if self.shadow.is_none() {
            return Err(TransactionError::Finished.into());
        }
        let shadow = self.shadow.take().expect("checked above");
        shadow.discard().delete()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn table_schema(&self, table: &str) -> Result<TableSchema, Error> {
        self.schema
            .table(table)
            .cloned()
            .ok_or_else(|| schema::Error::TableNotFound(table.to_string()).into())
    }

    fn check_row_shape(t: &TableSchema, values: &[SqlValue]) -> Result<(), Error> {
        if values.len() != t.columns.len() {
            return Err(schema::Error::ColumnCountMismatch {
                table: t.name.clone(),
                expected: t.columns.len(),
                got: values.len(),
            }
            .into());
        }
        for (i, col) in t.columns.iter().enumerate() {
            let is_alias = t.rowid_alias == Some(i);
            if col.not_null && !is_alias && values[i] == SqlValue::Null {
                return Err(schema::Error::NotNullViolation {
                    table: t.name.clone(),
                    column: col.name.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn with_mutator<T>(
        &mut self,
        f: impl FnOnce(&mut Mutator) -> Result<T, crate::btree::Error>,
    ) -> Result<T, crate::btree::Error> {
        let shadow = self.shadow.as_mut().expect("checked active");
        let mut mutator = Mutator::new(shadow, &mut self.freelist);
        f(&mut mutator)
    }

    fn next_rowid(&mut self, t: &TableSchema) -> Result<i64, Error> {
        let max_stored = self
            .with_mutator(|m| m.max_rowid(t.root_page))?
            .unwrap_or(0);
        let floor = self.rowid_floor.get(&t.name).copied().unwrap_or(0);
        let next = max_stored.max(floor) + 1;
        self.rowid_floor.insert(t.name.clone(), next);
        Ok(next)
    }

    /// The ordering for a WITHOUT ROWID table's primary-key prefix.
    fn keyed_table_ordering(t: &TableSchema) -> (KeyOrdering, usize) {
        let npk = t.columns.iter().take_while(|c| c.primary_key).count();
        (KeyOrdering::ascending(npk), npk)
    }

    fn insert_inner(
        &mut self,
        table: &str,
        values: &[SqlValue],
        explicit_rowid: Option<i64>,
    ) -> Result<i64, Error> {
        let t = self.table_schema(table)?;
        Self::check_row_shape(&t, values)?;

        if t.without_rowid {
            let (ordering, npk) = Self::keyed_table_ordering(&t);
            for i in 0..npk {
                if values[i] == SqlValue::Null {
                    return Err(schema::Error::NotNullViolation {
                        table: t.name.clone(),
                        column: t.columns[i].name.clone(),
                    }
                    .into());
                }
            }
            let record = encode_record(values);
            let root = t.root_page;
            self.with_mutator(|m| m.index_insert(root, &record, &ordering, Some(npk)))
                .map_err(|e| Self::map_unique(e, &format!("{}.PRIMARY KEY", t.name)))?;
            return Ok(0);
        }

        // Resolve the rowid: explicit argument, the INTEGER PRIMARY KEY
        // column, or assignment.
        let mut stored: Vec<SqlValue> = values.to_vec();
        let rowid = match explicit_rowid {
            Some(r) => r,
            None => match t.rowid_alias.map(|i| &values[i]) {
                Some(SqlValue::Int(n)) => *n,
                _ => self.next_rowid(&t)?,
            },
        };
        if let Some(i) = t.rowid_alias {
            // The alias column is stored as NULL; its value is the rowid.
            stored[i] = SqlValue::Null;
        }
        let floor = self.rowid_floor.entry(t.name.clone()).or_insert(0);
        *floor = (*floor).max(rowid);

        let record = encode_record(&stored);
        let root = t.root_page;
        self.with_mutator(|m| m.table_insert(root, rowid, &record))
            .map_err(|e| Self::map_unique(e, &format!("{}.rowid", t.name)))?;

        self.maintain_indexes_insert(&t, values, rowid)?;
        Ok(rowid)
    }

    fn map_unique(e: crate::btree::Error, what: &str) -> Error {
        match e {
            crate::btree::Error::KeyExists => schema::Error::UniqueViolation(what.to_string()).into(),
            other => other.into(),
        }
    }

    /// The (key columns..., rowid) entry record for one index and row.
    fn index_entry(
        t: &TableSchema,
        index: &schema::IndexSchema,
        values: &[SqlValue],
        rowid: i64,
    ) -> Result<Vec<u8>, Error> {
        let mut entry: Vec<ValueRef> = Vec::with_capacity(index.columns.len() + 1);
        for (col, _) in &index.columns {
            let ordinal = t
                .column_ordinal(col)
                .ok_or_else(|| schema::Error::UnknownColumn {
                    index: index.name.clone(),
                    table: t.name.clone(),
                    column: col.clone(),
                })?;
            if t.rowid_alias == Some(ordinal) {
                entry.push(ValueRef::Int(rowid));
            } else {
                entry.push(ValueRef::from(&values[ordinal]));
            }
        }
        let rowid_value = SqlValue::Int(rowid);
        entry.push(ValueRef::from(&rowid_value));
        Ok(encode_record_refs(&entry))
    }

    fn maintain_indexes_insert(
        &mut self,
        t: &TableSchema,
        values: &[SqlValue],
        rowid: i64,
    ) -> Result<(), Error> {
        let indexes: Vec<schema::IndexSchema> =
            self.schema.indexes_on(&t.name).cloned().collect();
        for index in indexes {
            let entry = Self::index_entry(t, &index, values, rowid)?;
            let ordering = index.key_ordering();
            let unique = index.unique.then_some(index.columns.len());
            let root = index.root_page;
            self.with_mutator(|m| m.index_insert(root, &entry, &ordering, unique))
                .map_err(|e| Self::map_unique(e, &index.name))?;
        }
        Ok(())
    }

    fn maintain_indexes_delete(
        &mut self,
        t: &TableSchema,
        values: &[SqlValue],
        rowid: i64,
    ) -> Result<(), Error> {
        let indexes: Vec<schema::IndexSchema> =
            self.schema.indexes_on(&t.name).cloned().collect();
        for index in indexes {
            let entry = Self::index_entry(t, &index, values, rowid)?;
            let ordering = index.key_ordering();
            let root = index.root_page;
            self.with_mutator(|m| m.index_delete(root, &entry, &ordering))?;
        }
        Ok(())
    }

    /// Decode the stored row `rowid` of `t` out of the shadow view.
    fn read_row(&self, t: &TableSchema, rowid: i64) -> Result<Vec<SqlValue>, Error> {
        let shadow = self.shadow.as_ref().expect("checked active");
        let mut cursor = Cursor::new(shadow, t.root_page);
        if cursor.seek_rowid(rowid)? != crate::btree::cursor::SeekResult::Found {
            return Err(crate::btree::Error::KeyNotFound.into());
        }
        let payload = cursor.payload()?;
        let mut refs = Vec::new();
        decode_record(payload, &mut refs)?;
        let mut values: Vec<SqlValue> = refs.iter().map(|v| v.to_owned()).collect();
        while values.len() < t.columns.len() {
            values.push(SqlValue::Null);
        }
        if let Some(i) = t.rowid_alias {
            values[i] = SqlValue::Int(rowid);
        }
        Ok(values)
    }

    fn update_inner(&mut self, table: &str, rowid: i64, values: &[SqlValue]) -> Result<(), Error> {
        let t = self.table_schema(table)?;
        Self::check_row_shape(&t, values)?;
        if t.without_rowid {
            // Keyed tables update by primary key: delete + insert.
            let (ordering, npk) = Self::keyed_table_ordering(&t);
            let record = encode_record(values);
            let probe = encode_record_refs(
                &values[..npk].iter().map(ValueRef::from).collect::<Vec<_>>(),
            );
            let root = t.root_page;
            self.with_mutator(|m| m.index_delete(root, &probe, &ordering))?;
            self.with_mutator(|m| m.index_insert(root, &record, &ordering, None))?;
            return Ok(());
        }

        let old_values = self.read_row(&t, rowid)?;
        self.maintain_indexes_delete(&t, &old_values, rowid)?;

        let mut stored: Vec<SqlValue> = values.to_vec();
        if let Some(i) = t.rowid_alias {
            stored[i] = SqlValue::Null;
        }
        let record = encode_record(&stored);
        let root = t.root_page;
        self.with_mutator(|m| m.table_update(root, rowid, &record))?;
        self.maintain_indexes_insert(&t, values, rowid)?;
        Ok(())
    }

    fn delete_where_inner(&mut self, table: &str, filter: &Filter) -> Result<usize, Error> {
        let t = self.table_schema(table)?;
        let resolved = filter.resolve(&t)?;

        if t.without_rowid {
            let (ordering, _) = Self::keyed_table_ordering(&t);
            // Collect matching key probes, then delete them.
            let mut probes: Vec<Vec<u8>> = Vec::new();
            {
                let shadow = self.shadow.as_ref().expect("checked active");
                let mut cursor = Cursor::new(shadow, t.root_page);
                cursor.first()?;
                while cursor.is_valid() {
                    let payload = cursor.payload()?;
                    if resolved.matches(payload, 0)? {
                        probes.push(payload.to_vec());
                    }
                    cursor.next()?;
                }
            }
            let root = t.root_page;
            for probe in &probes {
                self.with_mutator(|m| m.index_delete(root, probe, &ordering))?;
            }
            return Ok(probes.len());
        }

        let mut doomed: Vec<(i64, Vec<SqlValue>)> = Vec::new();
        {
            let shadow = self.shadow.as_ref().expect("checked active");
            let mut cursor = Cursor::new(shadow, t.root_page);
            cursor.first()?;
            while cursor.is_valid() {
                let rowid = cursor.rowid()?;
                let payload = cursor.payload()?;
                if resolved.matches(payload, rowid)? {
                    let mut refs = Vec::new();
                    decode_record(payload, &mut refs)?;
                    let mut values: Vec<SqlValue> = refs.iter().map(|v| v.to_owned()).collect();
                    while values.len() < t.columns.len() {
                        values.push(SqlValue::Null);
                    }
                    if let Some(i) = t.rowid_alias {
                        values[i] = SqlValue::Int(rowid);
                    }
                    doomed.push((rowid, values));
                }
                cursor.next()?;
            }
        }

        let root = t.root_page;
        for (rowid, values) in &doomed {
            self.maintain_indexes_delete(&t, values, *rowid)?;
            self.with_mutator(|m| m.table_delete(root, *rowid))?;
        }
        Ok(doomed.len())
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    fn name_in_use(&self, name: &str) -> bool {
        self.schema.table(name).is_some()
            || self.schema.index(name).is_some()
            || self.schema.view(name).is_some()
    }

    fn execute_inner(&mut self, sql: &str) -> Result<(), Error> {
        let stmt = parse_ddl_statement(sql).map_err(schema::Error::from)?;
        match stmt {
            DdlStatement::CreateTable(ct) => self.create_table(&ct.tablename, sql),
            DdlStatement::CreateIndex(ci) => self.create_index(&ci.indexname, sql),
            DdlStatement::CreateView(cv) => self.create_view(&cv.viewname, sql),
            DdlStatement::DropTable { name, if_exists } => self.drop_table(&name, if_exists),
            DdlStatement::DropIndex { name, if_exists } => self.drop_index(&name, if_exists),
        }
    }

    fn create_table(&mut self, name: &str, sql: &str) -> Result<(), Error> {
        if self.name_in_use(name) {
            return Err(schema::Error::DuplicateName(name.to_string()).into());
        }
        // Parse through the catalog path so the stored SQL round-trips.
        let parsed = schema::table_from_sql(name, 2, sql)?;
        if parsed.without_rowid {
            let npk = parsed.columns.iter().take_while(|c| c.primary_key).count();
            if npk == 0 || parsed.columns.iter().skip(npk).any(|c| c.primary_key) {
                return Err(schema::Error::UnsupportedWithoutRowid.into());
            }
        }
        let root = self.with_mutator(|m| m.create_tree(!parsed.without_rowid))?;
        self.insert_schema_row("table", name, name, root as i64, sql)?;
        let mut table = parsed;
        table.root_page = root;
        self.schema.tables.push(table);
        self.ddl_ran = true;
        debug!("ddl: created table {} at root {}", name, root);
        Ok(())
    }

    fn create_index(&mut self, name: &str, sql: &str) -> Result<(), Error> {
        if self.name_in_use(name) {
            return Err(schema::Error::DuplicateName(name.to_string()).into());
        }
        let parsed = schema::index_from_sql(name, 2, sql)?;
        let t = self.table_schema(&parsed.table)?;
        if t.without_rowid {
            return Err(schema::Error::IndexOnWithoutRowid.into());
        }
        for (col, _) in &parsed.columns {
            if t.column_ordinal(col).is_none() {
                return Err(schema::Error::UnknownColumn {
                    index: name.to_string(),
                    table: t.name.clone(),
                    column: col.clone(),
                }
                .into());
            }
        }
        let root = self.with_mutator(|m| m.create_tree(false))?;
        self.insert_schema_row("index", name, &parsed.table, root as i64, sql)?;
        let mut index = parsed;
        index.root_page = root;

        // Populate from the table as it stands in this transaction.
        let mut rows: Vec<(i64, Vec<SqlValue>)> = Vec::new();
        {
            let shadow = self.shadow.as_ref().expect("checked active");
            let mut cursor = Cursor::new(shadow, t.root_page);
            cursor.first()?;
            while cursor.is_valid() {
                let rowid = cursor.rowid()?;
                let payload = cursor.payload()?;
                let mut refs = Vec::new();
                decode_record(payload, &mut refs)?;
                let mut values: Vec<SqlValue> = refs.iter().map(|v| v.to_owned()).collect();
                while values.len() < t.columns.len() {
                    values.push(SqlValue::Null);
                }
                if let Some(i) = t.rowid_alias {
                    values[i] = SqlValue::Int(rowid);
                }
                rows.push((rowid, values));
                cursor.next()?;
            }
        }
        let ordering = index.key_ordering();
        let unique = index.unique.then_some(index.columns.len());
        for (rowid, values) in &rows {
            let entry = Self::index_entry(&t, &index, values, *rowid)?;
            self.with_mutator(|m| m.index_insert(root, &entry, &ordering, unique))
                .map_err(|e| Self::map_unique(e, name))?;
        }

        self.schema.indexes.push(index);
        self.ddl_ran = true;
        debug!("ddl: created index {} at root {}", name, root);
        Ok(())
    }

    fn create_view(&mut self, name: &str, sql: &str) -> Result<(), Error> {
        if self.name_in_use(name) {
            return Err(schema::Error::DuplicateName(name.to_string()).into());
        }
        self.insert_schema_row("view", name, name, 0, sql)?;
        self.schema.views.push(schema::ViewSchema {
            name: name.to_string(),
            sql: sql.to_string(),
        });
        self.ddl_ran = true;
        Ok(())
    }

    fn drop_table(&mut self, name: &str, if_exists: bool) -> Result<(), Error> {
        let Some(t) = self.schema.table(name).cloned() else {
            if if_exists {
                return Ok(());
            }
            return Err(schema::Error::TableNotFound(name.to_string()).into());
        };
        // Associated indexes go with the table.
        let indexes: Vec<schema::IndexSchema> =
            self.schema.indexes_on(&t.name).cloned().collect();
        for index in &indexes {
            let root = index.root_page;
            self.with_mutator(|m| m.free_tree(root))?;
            self.delete_schema_row("index", &index.name)?;
        }
        let root = t.root_page;
        self.with_mutator(|m| m.free_tree(root))?;
        self.delete_schema_row("table", name)?;
        self.schema.tables.retain(|x| !x.name.eq_ignore_ascii_case(name));
        self.schema
            .indexes
            .retain(|x| !x.table.eq_ignore_ascii_case(name));
        self.ddl_ran = true;
        debug!("ddl: dropped table {}", name);
        Ok(())
    }

    fn drop_index(&mut self, name: &str, if_exists: bool) -> Result<(), Error> {
        let Some(index) = self.schema.index(name).cloned() else {
            if if_exists {
                return Ok(());
            }
            return Err(schema::Error::IndexNotFound(name.to_string()).into());
        };
        let root = index.root_page;
        self.with_mutator(|m| m.free_tree(root))?;
        self.delete_schema_row("index", name)?;
        self.schema
            .indexes
            .retain(|x| !x.name.eq_ignore_ascii_case(name));
        self.ddl_ran = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Catalog rows
    // ------------------------------------------------------------------

    fn insert_schema_row(
        &mut self,
        row_type: &str,
        name: &str,
        tbl_name: &str,
        rootpage: i64,
        sql: &str,
    ) -> Result<(), Error> {
        let record = encode_record(&[
            SqlValue::from(row_type),
            SqlValue::from(name),
            SqlValue::from(tbl_name),
            SqlValue::Int(rootpage),
            SqlValue::from(sql),
        ]);
        let rowid = self
            .with_mutator(|m| m.max_rowid(SCHEMA_BTREE_ROOT_PAGENUM))?
            .unwrap_or(0)
            + 1;
        self.with_mutator(|m| m.table_insert(SCHEMA_BTREE_ROOT_PAGENUM, rowid, &record))?;
        Ok(())
    }

    fn delete_schema_row(&mut self, row_type: &str, name: &str) -> Result<(), Error> {
        let mut target: Option<i64> = None;
        {
            let shadow = self.shadow.as_ref().expect("checked active");
            let mut cursor = Cursor::new(shadow, SCHEMA_BTREE_ROOT_PAGENUM);
            cursor.first()?;
            while cursor.is_valid() {
                let rowid = cursor.rowid()?;
                let payload = cursor.payload()?;
                let mut refs = Vec::new();
                decode_record(payload, &mut refs)?;
                let matches = refs.first().and_then(|v| v.as_text().copied())
                    == Some(row_type.as_bytes())
                    && refs.get(1).and_then(|v| v.as_text().copied()) == Some(name.as_bytes());
                if matches {
                    target = Some(rowid);
                    break;
                }
                cursor.next()?;
            }
        }
        if let Some(rowid) = target {
            self.with_mutator(|m| m.table_delete(SCHEMA_BTREE_ROOT_PAGENUM, rowid))?;
        }
        Ok(())
    }
}

impl<'db> Drop for Transaction<'db> {
    fn drop(&mut self) {
        // An un-finished transaction rolls back: nothing reached the file,
        // so discarding the shadow and the journal suffices.
        if let Some(shadow) = self.shadow.take() {
            let _ = shadow.discard().delete();
        }
    }
}
