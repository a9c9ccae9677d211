//! Defines the value enums rows are made of.
//!
//! `SqlValue` owns its bytes and is what callers hand to the writer.
//! `ValueRef` borrows text/blob bytes straight out of a page buffer and is
//! what the record decoder hands back; `to_owned` copies out.

use enum_as_inner::EnumAsInner;

/// Can hold any value that can be stored in a table.
/// These are the storage classes SQLite files use: `NULL`, `INTEGER`,
/// `REAL`, `TEXT` and `BLOB`.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Int(x) => write!(f, "{}", x),
            SqlValue::Real(x) => write!(f, "{}", x),
            SqlValue::Text(x) => write!(f, "{}", x),
            SqlValue::Blob(_) => write!(f, "<BLOB>"),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

/// A value borrowed from a page buffer.  Text carries the raw bytes, which
/// are assumed UTF-8; conversion happens at the typed accessors.
#[derive(Debug, Clone, Copy, PartialEq, EnumAsInner)]
pub enum ValueRef<'a> {
    Null,
    Int(i64),
    Real(f64),
    Text(&'a [u8]),
    Blob(&'a [u8]),
}

impl<'a> ValueRef<'a> {
    /// Copies the referenced bytes into an owned `SqlValue`.
    ///
    /// Text that is not valid UTF-8 is carried over as a blob rather than
    /// lost; the file stored it, so the caller gets it back.
    pub fn to_owned(&self) -> SqlValue {
        match *self {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Int(i) => SqlValue::Int(i),
            ValueRef::Real(r) => SqlValue::Real(r),
            ValueRef::Text(b) => match std::str::from_utf8(b) {
                Ok(s) => SqlValue::Text(s.to_owned()),
                Err(_) => SqlValue::Blob(b.to_vec()),
            },
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

impl<'a> From<&'a SqlValue> for ValueRef<'a> {
    fn from(v: &'a SqlValue) -> Self {
        match v {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Int(i) => ValueRef::Int(*i),
            SqlValue::Real(r) => ValueRef::Real(*r),
            SqlValue::Text(s) => ValueRef::Text(s.as_bytes()),
            SqlValue::Blob(b) => ValueRef::Blob(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_round_trip() {
        let owned = vec![
            SqlValue::Null,
            SqlValue::Int(42),
            SqlValue::Real(2.5),
            SqlValue::Text("hello".to_string()),
            SqlValue::Blob(vec![0, 1, 255]),
        ];
        for v in &owned {
            assert_eq!(&ValueRef::from(v).to_owned(), v);
        }
    }

    #[test]
    fn test_non_utf8_text_degrades_to_blob() {
        let v = ValueRef::Text(&[0xff, 0xfe]);
        assert_eq!(v.to_owned(), SqlValue::Blob(vec![0xff, 0xfe]));
    }
}
