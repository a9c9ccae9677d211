//! Serial Types are how SQLite stores values in storage.
//!
//! Every column body in a record is tagged (in the record header) with a
//! serial type code giving its storage class and byte width.
use byteorder::{BigEndian, ByteOrder};

use crate::sql_value::ValueRef;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid serial type code {0}.")]
    InvalidSerialTypeCode(i64),
    #[error("Record body ends before the value its header promises.")]
    TruncatedValue,
    #[error("Value does not have the requested type.")]
    WrongType,
}

/// The number of body bytes a value of serial type `code` occupies.
///
/// Tabular comments are from the SQLite file format docs:
/// Serial Type    Content Size    Meaning
pub fn content_size(code: i64) -> Result<usize, Error> {
    match code {
        // 0        0       Value is a NULL.
        // 8        0       Value is the integer 0.
        // 9        0       Value is the integer 1.
        0 | 8 | 9 => Ok(0),
        // 1        1       Value is an 8-bit twos-complement integer.
        1 => Ok(1),
        // 2        2       Value is a big-endian 16-bit twos-complement integer.
        2 => Ok(2),
        // 3        3       Value is a big-endian 24-bit twos-complement integer.
        3 => Ok(3),
        // 4        4       Value is a big-endian 32-bit twos-complement integer.
        4 => Ok(4),
        // 5        6       Value is a big-endian 48-bit twos-complement integer.
        5 => Ok(6),
        // 6        8       Value is a big-endian 64-bit twos-complement integer.
        // 7        8       Value is a big-endian IEEE 754-2008 64-bit float.
        6 | 7 => Ok(8),
        // 10,11    variable    Reserved for internal use.
        // N>=12 & even    (N-12)/2    Value is a BLOB.
        // N>=13 & odd     (N-13)/2    Value is text.
        x if x >= 12 => Ok((x as usize - 12 - (x % 2) as usize) / 2),
        x => Err(Error::InvalidSerialTypeCode(x)),
    }
}

/// Sign-extending big-endian integer read for the 1/2/3/4/6/8 byte classes.
fn read_int(data: &[u8]) -> i64 {
    let mut v: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in data {
        v = (v << 8) | (b as i64 & 0xff);
    }
    v
}

/// Deserialize bytes tagged with `code` into a value borrowing from `data`.
pub fn to_value_ref(code: i64, data: &[u8]) -> Result<ValueRef<'_>, Error> {
    let size = content_size(code)?;
    if data.len() < size {
        return Err(Error::TruncatedValue);
    }
    let data = &data[..size];
    match code {
        0 => Ok(ValueRef::Null),
        1..=6 => Ok(ValueRef::Int(read_int(data))),
        7 => Ok(ValueRef::Real(BigEndian::read_f64(data))),
        8 => Ok(ValueRef::Int(0)),
        9 => Ok(ValueRef::Int(1)),
        x if x >= 12 && x % 2 == 0 => Ok(ValueRef::Blob(data)),
        x if x >= 13 => Ok(ValueRef::Text(data)),
        x => Err(Error::InvalidSerialTypeCode(x)),
    }
}

/// Extract an integer without constructing a `ValueRef`.
/// Fails with `WrongType` for non-integer storage classes.
pub fn decode_int64_direct(code: i64, data: &[u8]) -> Result<i64, Error> {
    match code {
        8 => Ok(0),
        9 => Ok(1),
        1..=6 => {
            let size = content_size(code)?;
            if data.len() < size {
                return Err(Error::TruncatedValue);
            }
            Ok(read_int(&data[..size]))
        }
        _ => Err(Error::WrongType),
    }
}

/// Extract a float without constructing a `ValueRef`.
/// Integer storage is widened, since SQLite stores `2.0` as integer 2.
pub fn decode_double_direct(code: i64, data: &[u8]) -> Result<f64, Error> {
    match code {
        7 => {
            if data.len() < 8 {
                return Err(Error::TruncatedValue);
            }
            Ok(BigEndian::read_f64(data))
        }
        1..=6 | 8 | 9 => Ok(decode_int64_direct(code, data)? as f64),
        _ => Err(Error::WrongType),
    }
}

/// Extract text bytes without constructing a `ValueRef`.
pub fn decode_string_direct(code: i64, data: &[u8]) -> Result<&[u8], Error> {
    if code >= 13 && code % 2 == 1 {
        let size = content_size(code)?;
        if data.len() < size {
            return Err(Error::TruncatedValue);
        }
        Ok(&data[..size])
    } else {
        Err(Error::WrongType)
    }
}

/// Extract blob bytes without constructing a `ValueRef`.
pub fn decode_blob_direct(code: i64, data: &[u8]) -> Result<&[u8], Error> {
    if code >= 12 && code % 2 == 0 {
        let size = content_size(code)?;
        if data.len() < size {
            return Err(Error::TruncatedValue);
        }
        Ok(&data[..size])
    } else {
        Err(Error::WrongType)
    }
}
