//! sharc is an embeddable storage engine whose files are SQLite 3
//! compatible, with optional page-level authenticated encryption.
//!
//! The stack is five layers, each depending only on those below: the page
//! substrate (`pager`, `shadow`), the page transform (`crypto`), the
//! record codec (`varint`, `serial_type`, `record`), the btree layer
//! (`btree`), and the database object with its single-writer transaction
//! layer (`db`, `writer`, `journal`, `locks`, `schema`).
//!
//! A plain database written here opens in any SQLite 3 tool; an encrypted
//! database is the same page image behind a per-page AES-256-GCM
//! transform and is unreadable without the password.
//!
//! ```no_run
//! use sharc::{Database, DatabaseOptions, SqlValue};
//!
//! let mut db = Database::create("app.db", DatabaseOptions::default().writable(true))?;
//! let mut txn = db.begin_transaction()?;
//! txn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")?;
//! txn.insert("t", &[SqlValue::Null, SqlValue::from("alice")])?;
//! txn.commit()?;
//!
//! let mut reader = db.create_reader("t")?;
//! while let Some(row) = reader.next_row()? {
//!     println!("{:?} {:?}", row.row_id(), row.get_string(1));
//! }
//! # Ok::<(), sharc::Error>(())
//! ```

extern crate pest;
#[macro_use]
extern crate pest_derive;

pub mod ast;
pub mod btree;
pub mod crypto;
pub mod db;
pub mod dbheader;
pub mod filter;
pub mod freelist;
pub mod journal;
pub mod locks;
pub mod pager;
pub mod parser;
pub mod pt_to_ast;
pub mod reader;
pub mod record;
pub mod schema;
pub mod serial_type;
pub mod shadow;
pub mod sql_type;
pub mod sql_value;
pub mod varint;
pub mod writer;

pub use db::{Database, DatabaseOptions, IntegrityReport};
pub use filter::{Filter, FilterOp};
pub use journal::JournalMode;
pub use reader::{AccessPath, Reader, Row};
pub use schema::Schema;
pub use sql_type::SqlType;
pub use sql_value::{SqlValue, ValueRef};
pub use writer::{Transaction, TransactionError};

/// Everything that can go wrong, one layer per variant.  Errors bubble to
/// this boundary unchanged; the only internal recovery is journal replay
/// at open.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    InvalidDatabase(#[from] dbheader::Error),
    #[error("{0}")]
    Pager(#[from] pager::Error),
    #[error("{0}")]
    Shadow(#[from] shadow::Error),
    #[error("{0}")]
    Btree(#[from] btree::Error),
    #[error("{0}")]
    Freelist(#[from] freelist::Error),
    #[error("{0}")]
    Record(#[from] record::Error),
    #[error("{0}")]
    Crypto(#[from] crypto::Error),
    #[error("{0}")]
    Schema(#[from] schema::Error),
    #[error("{0}")]
    Journal(#[from] journal::Error),
    #[error("{0}")]
    Lock(#[from] locks::Error),
    #[error("{0}")]
    Reader(#[from] reader::Error),
    #[error("{0}")]
    Filter(#[from] filter::Error),
    #[error("{0}")]
    Transaction(#[from] writer::TransactionError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
