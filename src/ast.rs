//! The AST for the DDL subset the writer executes.
//! One enum per production group; lexical detail like case and quoting is
//! discarded during lowering (`pt_to_ast`).

use enum_as_inner::EnumAsInner;

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum DdlStatement {
    CreateTable(CreateTableStatement),
    CreateIndex(CreateIndexStatement),
    CreateView(CreateViewStatement),
    DropTable { name: String, if_exists: bool },
    DropIndex { name: String, if_exists: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStatement {
    pub tablename: String,
    pub coldefs: Vec<ColDef>,
    pub without_rowid: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColDef {
    pub colname: String,
    /// Declared type token, verbatim (`INTEGER`, `text`, ...); None when
    /// the column was declared bare.
    pub coltype: Option<String>,
    pub not_null: bool,
    pub primary_key: bool,
    pub pk_descending: bool,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexStatement {
    pub indexname: String,
    pub tablename: String,
    pub unique: bool,
    pub columns: Vec<IndexedColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedColumn {
    pub name: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateViewStatement {
    pub viewname: String,
}
