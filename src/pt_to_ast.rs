//! `pt_to_ast` has routines for converting parse trees to ASTs for the DDL
//! subset.
//! A Pest parse tree has one enum for all possible terminals and
//! non-terminals; the AST has enums for groups of terminals used in the
//! same production and discards lexical detail like case and quoting.

use pest::iterators::Pair;
use pest::Parser;

use crate::ast::{
    ColDef, CreateIndexStatement, CreateTableStatement, CreateViewStatement, DdlStatement,
    IndexedColumn,
};
use crate::parser::{Rule, SQLParser};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("DDL syntax error: {0}")]
    Syntax(String),
}

fn identifier_text(pair: Pair<'_, Rule>) -> String {
    let inner = pair.into_inner().next().expect("identifier has one child");
    match inner.as_rule() {
        Rule::quoted_identifier => {
            let s = inner.as_str();
            s[1..s.len() - 1].to_string()
        }
        Rule::bare_identifier => inner.as_str().to_string(),
        _ => unreachable!("identifier children"),
    }
}

pub fn parse_ddl_statement(sql: &str) -> Result<DdlStatement, Error> {
    let mut pairs =
        SQLParser::parse(Rule::ddl_stmt, sql).map_err(|e| Error::Syntax(e.to_string()))?;
    let stmt = pairs
        .next()
        .and_then(|p| p.into_inner().next())
        .ok_or_else(|| Error::Syntax("empty statement".to_string()))?;
    match stmt.as_rule() {
        Rule::create_table_stmt => Ok(DdlStatement::CreateTable(create_table_to_ast(stmt))),
        Rule::create_index_stmt => Ok(DdlStatement::CreateIndex(create_index_to_ast(stmt))),
        Rule::create_view_stmt => Ok(DdlStatement::CreateView(create_view_to_ast(stmt))),
        Rule::drop_table_stmt => {
            let (name, if_exists) = drop_to_parts(stmt);
            Ok(DdlStatement::DropTable { name, if_exists })
        }
        Rule::drop_index_stmt => {
            let (name, if_exists) = drop_to_parts(stmt);
            Ok(DdlStatement::DropIndex { name, if_exists })
        }
        r => Err(Error::Syntax(format!("unexpected rule {:?}", r))),
    }
}

fn create_table_to_ast(stmt: Pair<'_, Rule>) -> CreateTableStatement {
    let mut tablename = String::new();
    let mut coldefs: Vec<ColDef> = vec![];
    let mut without_rowid = false;
    for c in stmt.into_inner() {
        match c.as_rule() {
            Rule::identifier => tablename = identifier_text(c),
            Rule::column_defs => {
                for column_def in c.into_inner() {
                    coldefs.push(column_def_to_ast(column_def));
                }
            }
            Rule::without_rowid => without_rowid = true,
            _ => unreachable!("create_table children"),
        }
    }
    CreateTableStatement {
        tablename,
        coldefs,
        without_rowid,
    }
}

fn column_def_to_ast(pair: Pair<'_, Rule>) -> ColDef {
    let mut def = ColDef {
        colname: String::new(),
        coltype: None,
        not_null: false,
        primary_key: false,
        pk_descending: false,
        unique: false,
    };
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::identifier => def.colname = identifier_text(part),
            Rule::type_name => def.coltype = Some(part.as_str().to_string()),
            Rule::column_constraint => {
                let constraint = part.into_inner().next().expect("constraint child");
                match constraint.as_rule() {
                    Rule::primary_key_clause => {
                        def.primary_key = true;
                        def.pk_descending = constraint
                            .into_inner()
                            .next()
                            .map(|o| o.as_str().eq_ignore_ascii_case("DESC"))
                            .unwrap_or(false);
                    }
                    Rule::not_null_clause => def.not_null = true,
                    Rule::unique_clause => def.unique = true,
                    _ => unreachable!("constraint kinds"),
                }
            }
            _ => unreachable!("column_def children"),
        }
    }
    def
}

fn create_index_to_ast(stmt: Pair<'_, Rule>) -> CreateIndexStatement {
    use itertools::Itertools;
    let mut unique = false;
    let mut names: Vec<String> = vec![];
    let mut columns: Vec<IndexedColumn> = vec![];
    for c in stmt.into_inner() {
        match c.as_rule() {
            Rule::unique_index => unique = true,
            Rule::identifier => names.push(identifier_text(c)),
            Rule::indexed_columns => {
                for ic in c.into_inner() {
                    let mut name = String::new();
                    let mut descending = false;
                    for part in ic.into_inner() {
                        match part.as_rule() {
                            Rule::identifier => name = identifier_text(part),
                            Rule::sort_order => {
                                descending = part.as_str().eq_ignore_ascii_case("DESC")
                            }
                            _ => unreachable!("indexed_column children"),
                        }
                    }
                    columns.push(IndexedColumn { name, descending });
                }
            }
            _ => unreachable!("create_index children"),
        }
    }
    let (indexname, tablename) = names
        .into_iter()
        .collect_tuple()
        .expect("the grammar yields exactly two identifiers");
    CreateIndexStatement {
        indexname,
        tablename,
        unique,
        columns,
    }
}

fn create_view_to_ast(stmt: Pair<'_, Rule>) -> CreateViewStatement {
    let mut viewname = String::new();
    for c in stmt.into_inner() {
        if c.as_rule() == Rule::identifier {
            viewname = identifier_text(c);
        }
    }
    CreateViewStatement { viewname }
}

fn drop_to_parts(stmt: Pair<'_, Rule>) -> (String, bool) {
    let mut name = String::new();
    let mut if_exists = false;
    for c in stmt.into_inner() {
        match c.as_rule() {
            Rule::if_exists => if_exists = true,
            Rule::identifier => name = identifier_text(c),
            _ => unreachable!("drop children"),
        }
    }
    (name, if_exists)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_table() {
        let input = "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL, tag)";
        let ast = parse_ddl_statement(input).unwrap();
        let ct = ast.as_create_table().unwrap();
        assert_eq!(ct.tablename, "t");
        assert!(!ct.without_rowid);
        assert_eq!(ct.coldefs.len(), 3);
        assert_eq!(ct.coldefs[0].colname, "id");
        assert_eq!(ct.coldefs[0].coltype.as_deref(), Some("INTEGER"));
        assert!(ct.coldefs[0].primary_key);
        assert!(ct.coldefs[1].not_null);
        assert_eq!(ct.coldefs[2].coltype, None);
    }

    #[test]
    fn test_parse_create_table_without_rowid() {
        let input = "create table kv (k TEXT PRIMARY KEY, v BLOB) without rowid";
        let ast = parse_ddl_statement(input).unwrap();
        let ct = ast.as_create_table().unwrap();
        assert!(ct.without_rowid);
        assert!(ct.coldefs[0].primary_key);
    }

    #[test]
    fn test_parse_primary_key_without_type() {
        // "PRIMARY" must not be eaten as the declared type.
        let input = "CREATE TABLE t (id PRIMARY KEY, v INT)";
        let ast = parse_ddl_statement(input).unwrap();
        let ct = ast.as_create_table().unwrap();
        assert_eq!(ct.coldefs[0].coltype, None);
        assert!(ct.coldefs[0].primary_key);
    }

    #[test]
    fn test_parse_create_index() {
        let cases = vec![
            (
                "CREATE INDEX i ON u(age)",
                ("i", "u", false, vec![("age", false)]),
            ),
            (
                "CREATE UNIQUE INDEX ux ON u(age DESC, name)",
                ("ux", "u", true, vec![("age", true), ("name", false)]),
            ),
        ];
        for (input, (iname, tname, unique, cols)) in cases {
            let ast = parse_ddl_statement(input).unwrap();
            let ci = ast.as_create_index().unwrap();
            assert_eq!(ci.indexname, iname);
            assert_eq!(ci.tablename, tname);
            assert_eq!(ci.unique, unique);
            let got: Vec<(&str, bool)> = ci
                .columns
                .iter()
                .map(|c| (c.name.as_str(), c.descending))
                .collect();
            assert_eq!(got, cols);
        }
    }

    #[test]
    fn test_parse_create_view() {
        let input = "CREATE VIEW adults AS SELECT id FROM u WHERE age >= 18";
        let ast = parse_ddl_statement(input).unwrap();
        assert_eq!(ast.as_create_view().unwrap().viewname, "adults");
    }

    #[test]
    fn test_parse_drops() {
        let ast = parse_ddl_statement("DROP TABLE t;").unwrap();
        assert_eq!(
            ast,
            DdlStatement::DropTable {
                name: "t".to_string(),
                if_exists: false
            }
        );
        let ast = parse_ddl_statement("drop index if exists i").unwrap();
        assert_eq!(
            ast,
            DdlStatement::DropIndex {
                name: "i".to_string(),
                if_exists: true
            }
        );
    }

    #[test]
    fn test_quoted_identifiers() {
        let ast = parse_ddl_statement("CREATE TABLE \"my table\" (\"a col\" INT)").unwrap();
        let ct = ast.as_create_table().unwrap();
        assert_eq!(ct.tablename, "my table");
        assert_eq!(ct.coldefs[0].colname, "a col");
    }

    #[test]
    fn test_syntax_errors() {
        for bad in [
            "CREATE TABLE",
            "SELECT * FROM t",
            "CREATE TABLE t (a int",
            "DROP VIEW v",
        ] {
            assert!(parse_ddl_statement(bad).is_err(), "{}", bad);
        }
    }
}
