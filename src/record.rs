//! The record codec.
//!
//! A record is a header and a body, in that order.  The header begins with a
//! single varint which determines the total number of bytes in the header,
//! followed by one serial-type varint per column; the body is the
//! concatenated column values.  See `serial_type` for the per-value codes.
//!
//! The decode side is split so readers pay only for the columns they touch:
//! parse the header once, then pull individual columns by offset.

use crate::serial_type;
use crate::sql_value::{SqlValue, ValueRef};
use crate::varint;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Record header is malformed or ends before its declared length.")]
    MalformedHeader,
    #[error("Record body is shorter than its serial types imply.")]
    TruncatedBody,
    #[error("Record column error: {0}")]
    Serial(#[from] serial_type::Error),
    #[error("Column index {0} is beyond the record's column count.")]
    ColumnOutOfRange(usize),
}

/// Parse the record header, pushing one serial type code per column into
/// `dst`.  Returns the offset of the first body byte.
pub fn read_serial_types(payload: &[u8], dst: &mut Vec<i64>) -> Result<usize, Error> {
    dst.clear();
    let (hdr_len, hdr_len_len) = varint::read(payload).ok_or(Error::MalformedHeader)?;
    let hdr_len = hdr_len as usize;
    if hdr_len < hdr_len_len || hdr_len > payload.len() {
        return Err(Error::MalformedHeader);
    }
    let mut offset = hdr_len_len;
    while offset < hdr_len {
        let (code, n) = varint::read(&payload[offset..hdr_len]).ok_or(Error::MalformedHeader)?;
        offset += n;
        dst.push(code);
    }
    Ok(hdr_len)
}

/// Walk the serial-type sizes to produce each column's body offset.
/// `dst[i]` is the offset of column `i`'s first byte within the payload.
pub fn compute_column_offsets(
    serial_types: &[i64],
    body_offset: usize,
    dst: &mut Vec<usize>,
) -> Result<(), Error> {
    dst.clear();
    let mut offset = body_offset;
    for &code in serial_types {
        dst.push(offset);
        offset += serial_type::content_size(code)?;
    }
    Ok(())
}

/// Decode column `i` given a previously parsed header.
pub fn decode_column<'a>(
    payload: &'a [u8],
    i: usize,
    serial_types: &[i64],
    body_offset: usize,
) -> Result<ValueRef<'a>, Error> {
    if i >= serial_types.len() {
        return Err(Error::ColumnOutOfRange(i));
    }
    let mut offset = body_offset;
    for &code in &serial_types[..i] {
        offset += serial_type::content_size(code)?;
    }
    if offset > payload.len() {
        return Err(Error::TruncatedBody);
    }
    serial_type::to_value_ref(serial_types[i], &payload[offset..]).map_err(|e| match e {
        serial_type::Error::TruncatedValue => Error::TruncatedBody,
        other => Error::Serial(other),
    })
}

/// Decode every column of a record in one pass.
pub fn decode_record<'a>(payload: &'a [u8], dst: &mut Vec<ValueRef<'a>>) -> Result<(), Error> {
    dst.clear();
    let mut types = Vec::new();
    let body_offset = read_serial_types(payload, &mut types)?;
    let mut offset = body_offset;
    for &code in &types {
        if offset > payload.len() {
            return Err(Error::TruncatedBody);
        }
        let v = serial_type::to_value_ref(code, &payload[offset..]).map_err(|e| match e {
            serial_type::Error::TruncatedValue => Error::TruncatedBody,
            other => Error::Serial(other),
        })?;
        offset += serial_type::content_size(code)?;
        dst.push(v);
    }
    Ok(())
}

/// Iterator over `(serial_type, body_bytes)` pairs of a record.
/// Borrows the payload for the lifetime of the iterator.
pub struct ValueIterator<'a> {
    data: &'a [u8],
    hdr_offset: usize,
    hdr_len: usize,
    value_offset: usize,
    failed: bool,
}

impl<'a> ValueIterator<'a> {
    pub fn new(payload: &'a [u8]) -> Result<ValueIterator<'a>, Error> {
        let (hdr_len, hdr_len_len) = varint::read(payload).ok_or(Error::MalformedHeader)?;
        let hdr_len = hdr_len as usize;
        if hdr_len < hdr_len_len || hdr_len > payload.len() {
            return Err(Error::MalformedHeader);
        }
        Ok(ValueIterator {
            data: payload,
            hdr_offset: hdr_len_len,
            hdr_len,
            value_offset: hdr_len,
            failed: false,
        })
    }
}

impl<'a> Iterator for ValueIterator<'a> {
    type Item = Result<(i64, &'a [u8]), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.hdr_offset >= self.hdr_len {
            return None;
        }
        let (code, n) = match varint::read(&self.data[self.hdr_offset..self.hdr_len]) {
            Some(x) => x,
            None => {
                self.failed = true;
                return Some(Err(Error::MalformedHeader));
            }
        };
        self.hdr_offset += n;
        let size = match serial_type::content_size(code) {
            Ok(s) => s,
            Err(e) => {
                self.failed = true;
                return Some(Err(Error::Serial(e)));
            }
        };
        if self.value_offset + size > self.data.len() {
            self.failed = true;
            return Some(Err(Error::TruncatedBody));
        }
        let body = &self.data[self.value_offset..self.value_offset + size];
        self.value_offset += size;
        Some(Ok((code, body)))
    }
}

/// The serial type code the encoder picks for a value, and its body size.
///
/// Integers use the shortest storage class that holds them; 0 and 1 use the
/// literal codes.  Floats always use serial type 7.
pub fn serial_type_for(v: &ValueRef) -> (i64, usize) {
    match *v {
        ValueRef::Null => (0, 0),
        ValueRef::Int(0) => (8, 0),
        ValueRef::Int(1) => (9, 0),
        ValueRef::Int(i) => {
            if (-(1 << 7)..1 << 7).contains(&i) {
                (1, 1)
            } else if (-(1 << 15)..1 << 15).contains(&i) {
                (2, 2)
            } else if (-(1 << 23)..1 << 23).contains(&i) {
                (3, 3)
            } else if (-(1 << 31)..1 << 31).contains(&i) {
                (4, 4)
            } else if (-(1i64 << 47)..1i64 << 47).contains(&i) {
                (5, 6)
            } else {
                (6, 8)
            }
        }
        ValueRef::Real(_) => (7, 8),
        ValueRef::Blob(b) => ((b.len() as i64) * 2 + 12, b.len()),
        ValueRef::Text(t) => ((t.len() as i64) * 2 + 13, t.len()),
    }
}

fn push_int_body(out: &mut Vec<u8>, value: i64, size: usize) {
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[8 - size..]);
}

/// Encode an ordered column list into record format.
pub fn encode_record(values: &[SqlValue]) -> Vec<u8> {
    encode_record_refs(&values.iter().map(ValueRef::from).collect::<Vec<_>>())
}

/// Encode from borrowed values (the index-entry path uses this to avoid
/// copying key columns it already holds as refs).
pub fn encode_record_refs(values: &[ValueRef]) -> Vec<u8> {
    let mut types = Vec::with_capacity(values.len());
    let mut serial_types_len = 0;
    for v in values {
        let (code, _) = serial_type_for(v);
        types.push(code);
        serial_types_len += varint::len(code);
    }

    // The header-length varint counts itself, so widening it can widen the
    // header; iterate until the width is stable.
    let mut header_len = serial_types_len + 1;
    loop {
        let needed = serial_types_len + varint::len(header_len as i64);
        if needed == header_len {
            break;
        }
        header_len = needed;
    }

    let mut out = Vec::with_capacity(header_len + 16);
    varint::push(header_len as i64, &mut out);
    for &code in &types {
        varint::push(code, &mut out);
    }
    for v in values {
        match *v {
            ValueRef::Null | ValueRef::Int(0) | ValueRef::Int(1) => {}
            ValueRef::Int(i) => {
                let (_, size) = serial_type_for(v);
                push_int_body(&mut out, i, size);
            }
            ValueRef::Real(r) => out.extend_from_slice(&r.to_be_bytes()),
            ValueRef::Text(b) | ValueRef::Blob(b) => out.extend_from_slice(b),
        }
    }
    out
}
