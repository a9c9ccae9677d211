//! The schema catalog, parsed from the schema btree rooted at page 1.
//!
//! Catalog rows are `(type, name, tbl_name, rootpage, sql)` with
//! `type in {table, index, view}`.  The catalog is per-database state: it
//! is built at open, rebuilt after a commit that ran DDL, and dropped with
//! the database object.  Nothing here executes SQL; view bodies are stored
//! verbatim for the query layer upstairs.

use std::str::FromStr;

use crate::ast::DdlStatement;
use crate::btree::compare::KeyOrdering;
use crate::btree::cursor::Cursor;
use crate::btree::PageSource;
use crate::pager::PageNum;
use crate::pt_to_ast::parse_ddl_statement;
use crate::record;
use crate::sql_type::SqlType;
use crate::sql_value::ValueRef;

// Page 1 (the first page) is always a btree page, and it is the root page
// of the schema table.  It has references to the root pages of other
// btrees.
pub const SCHEMA_BTREE_ROOT_PAGENUM: PageNum = 1;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Schema: {0}")]
    Ddl(#[from] crate::pt_to_ast::Error),
    #[error("Schema: {0}")]
    Btree(#[from] crate::btree::Error),
    #[error("Schema: {0}")]
    Record(#[from] record::Error),
    #[error("Schema: catalog row {0} is malformed.")]
    MalformedRow(i64),
    #[error("Schema: object {0} has an invalid root page.")]
    BadRootPage(String),
    #[error("Schema: duplicate table or index name {0}.")]
    DuplicateName(String),
    #[error("Schema: index {index} references unknown column {column} of table {table}.")]
    UnknownColumn {
        index: String,
        table: String,
        column: String,
    },
    #[error("Schema: index {0} references unknown table {1}.")]
    UnknownTable(String, String),
    #[error("Schema: table {0} not found.")]
    TableNotFound(String),
    #[error("Schema: index {0} not found.")]
    IndexNotFound(String),
    #[error("Schema: UNIQUE constraint violated on {0}.")]
    UniqueViolation(String),
    #[error("Schema: NOT NULL constraint violated on {table}.{column}.")]
    NotNullViolation { table: String, column: String },
    #[error("Schema: table {table} has {expected} columns, {got} values given.")]
    ColumnCountMismatch {
        table: String,
        expected: usize,
        got: usize,
    },
    #[error("Schema: WITHOUT ROWID tables need their PRIMARY KEY on the leading column(s).")]
    UnsupportedWithoutRowid,
    #[error("Schema: secondary indexes on WITHOUT ROWID tables are not supported.")]
    IndexOnWithoutRowid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    /// Declared type token, normalized when it matches a known alias.
    pub decl_type: Option<SqlType>,
    /// The declared type verbatim, for round-tripping unknown names.
    pub decl_type_raw: Option<String>,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub root_page: PageNum,
    pub columns: Vec<ColumnSchema>,
    /// Ordinal of an `INTEGER PRIMARY KEY` column aliasing the rowid.
    pub rowid_alias: Option<usize>,
    pub without_rowid: bool,
    pub sql: String,
}

impl TableSchema {
    pub fn column_ordinal(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSchema {
    pub name: String,
    pub table: String,
    pub root_page: PageNum,
    pub unique: bool,
    /// `(column name, descending)` in index order.
    pub columns: Vec<(String, bool)>,
    pub sql: String,
}

impl IndexSchema {
    pub fn key_ordering(&self) -> KeyOrdering {
        KeyOrdering {
            descending: self.columns.iter().map(|(_, d)| *d).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewSchema {
    pub name: String,
    pub sql: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    pub tables: Vec<TableSchema>,
    pub indexes: Vec<IndexSchema>,
    pub views: Vec<ViewSchema>,
}

impl Schema {
    /// Build the catalog by scanning the schema btree.
    pub fn load<S: PageSource>(source: &S) -> Result<Schema, Error> {
        let mut schema = Schema::default();
        let mut cursor = Cursor::new(source, SCHEMA_BTREE_ROOT_PAGENUM);
        cursor.first()?;
        while cursor.is_valid() {
            let rowid = cursor.rowid()?;
            let payload = cursor.payload()?;
            let mut values = Vec::new();
            record::decode_record(payload, &mut values)?;
            if values.len() < 5 {
                return Err(Error::MalformedRow(rowid));
            }
            let text = |v: &ValueRef| -> Option<String> {
                v.as_text().and_then(|b| std::str::from_utf8(b).ok()).map(String::from)
            };
            let row_type = text(&values[0]).ok_or(Error::MalformedRow(rowid))?;
            let name = text(&values[1]).ok_or(Error::MalformedRow(rowid))?;
            let root_page = values[3].as_int().copied().unwrap_or(0) as PageNum;
            let sql = text(&values[4]).unwrap_or_default();
            match row_type.as_str() {
                "table" => schema.tables.push(table_from_sql(&name, root_page, &sql)?),
                "index" => schema.indexes.push(index_from_sql(&name, root_page, &sql)?),
                "view" => schema.views.push(ViewSchema { name, sql }),
                // Triggers and such are outside the supported subset; they
                // are preserved on disk and ignored here.
                _ => {}
            }
            cursor.next()?;
        }
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<(), Error> {
        let mut names: Vec<&str> = self
            .tables
            .iter()
            .map(|t| t.name.as_str())
            .chain(self.indexes.iter().map(|i| i.name.as_str()))
            .collect();
        names.sort_unstable();
        for w in names.windows(2) {
            if w[0].eq_ignore_ascii_case(w[1]) {
                return Err(Error::DuplicateName(w[0].to_string()));
            }
        }
        for t in &self.tables {
            if t.root_page < 2 {
                return Err(Error::BadRootPage(t.name.clone()));
            }
        }
        for i in &self.indexes {
            if i.root_page < 2 {
                return Err(Error::BadRootPage(i.name.clone()));
            }
            let table = self
                .table(&i.table)
                .ok_or_else(|| Error::UnknownTable(i.name.clone(), i.table.clone()))?;
            for (col, _) in &i.columns {
                if table.column_ordinal(col).is_none() {
                    return Err(Error::UnknownColumn {
                        index: i.name.clone(),
                        table: i.table.clone(),
                        column: col.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }

    pub fn view(&self, name: &str) -> Option<&ViewSchema> {
        self.views.iter().find(|v| v.name.eq_ignore_ascii_case(name))
    }

    /// Indexes over `table`, in catalog order.
    pub fn indexes_on<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a IndexSchema> {
        self.indexes
            .iter()
            .filter(move |i| i.table.eq_ignore_ascii_case(table))
    }
}

/// Rebuild a table description from its stored CREATE TABLE statement.
pub fn table_from_sql(name: &str, root_page: PageNum, sql: &str) -> Result<TableSchema, Error> {
    let stmt = parse_ddl_statement(sql)?;
    let DdlStatement::CreateTable(ct) = stmt else {
        return Err(Error::MalformedRow(0));
    };
    let columns: Vec<ColumnSchema> = ct
        .coldefs
        .iter()
        .map(|c| ColumnSchema {
            name: c.colname.clone(),
            decl_type: c.coltype.as_deref().and_then(|t| SqlType::from_str(t).ok()),
            decl_type_raw: c.coltype.clone(),
            not_null: c.not_null,
            primary_key: c.primary_key,
        })
        .collect();
    // An `INTEGER PRIMARY KEY` column is an alias for the rowid (unless the
    // table has no rowid at all).
    let rowid_alias = if ct.without_rowid {
        None
    } else {
        columns
            .iter()
            .position(|c| c.primary_key && c.decl_type == Some(SqlType::Int))
    };
    Ok(TableSchema {
        name: name.to_string(),
        root_page,
        columns,
        rowid_alias,
        without_rowid: ct.without_rowid,
        sql: sql.to_string(),
    })
}

/// Rebuild an index description from its stored CREATE INDEX statement.
pub fn index_from_sql(name: &str, root_page: PageNum, sql: &str) -> Result<IndexSchema, Error> {
    let stmt = parse_ddl_statement(sql)?;
    let DdlStatement::CreateIndex(ci) = stmt else {
        return Err(Error::MalformedRow(0));
    };
    Ok(IndexSchema {
        name: name.to_string(),
        table: ci.tablename,
        root_page,
        unique: ci.unique,
        columns: ci
            .columns
            .into_iter()
            .map(|c| (c.name, c.descending))
            .collect(),
        sql: sql.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_from_sql_rowid_alias() {
        let t = table_from_sql(
            "t",
            2,
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INT)",
        )
        .unwrap();
        assert_eq!(t.rowid_alias, Some(0));
        assert_eq!(t.columns.len(), 3);
        assert_eq!(t.columns[1].decl_type, Some(SqlType::Text));
        assert!(t.columns[1].not_null);
        assert_eq!(t.column_ordinal("AGE"), Some(2));
    }

    #[test]
    fn test_non_integer_pk_is_not_an_alias() {
        let t = table_from_sql("t", 2, "CREATE TABLE t (k TEXT PRIMARY KEY, v INT)").unwrap();
        assert_eq!(t.rowid_alias, None);
    }

    #[test]
    fn test_without_rowid_table() {
        let t = table_from_sql(
            "kv",
            2,
            "CREATE TABLE kv (k TEXT PRIMARY KEY, v BLOB) WITHOUT ROWID",
        )
        .unwrap();
        assert!(t.without_rowid);
        assert_eq!(t.rowid_alias, None);
    }

    #[test]
    fn test_index_from_sql() {
        let i = index_from_sql("i", 3, "CREATE UNIQUE INDEX i ON u(age DESC, name)").unwrap();
        assert!(i.unique);
        assert_eq!(i.table, "u");
        assert_eq!(
            i.columns,
            vec![("age".to_string(), true), ("name".to_string(), false)]
        );
        assert_eq!(i.key_ordering().descending, vec![true, false]);
    }

    #[test]
    fn test_validate_rejects_unknown_index_column() {
        let mut schema = Schema::default();
        schema
            .tables
            .push(table_from_sql("u", 2, "CREATE TABLE u (id INT)").unwrap());
        schema
            .indexes
            .push(index_from_sql("i", 3, "CREATE INDEX i ON u(age)").unwrap());
        assert!(matches!(
            schema.validate(),
            Err(Error::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut schema = Schema::default();
        schema
            .tables
            .push(table_from_sql("t", 2, "CREATE TABLE t (a INT)").unwrap());
        schema
            .tables
            .push(table_from_sql("T", 3, "CREATE TABLE T (b INT)").unwrap());
        assert!(matches!(schema.validate(), Err(Error::DuplicateName(_))));
    }
}
