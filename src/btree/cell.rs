//! cell reads and writes the four btree cell formats.
//!
//! Cell formats from https://www.sqlite.org/fileformat2.html#b_tree_pages
//!
//! Table B-Tree Leaf Cell (page type 0x0d):
//!   A varint which is the total number of bytes of payload, including any overflow
//!   A varint which is the integer key, a.k.a. "rowid"
//!   The initial portion of the payload that does not spill to overflow pages.
//!   A 4-byte big-endian integer page number for the first page of the
//!   overflow page list - omitted if all payload fits on the b-tree page.
//!
//! Table B-Tree Interior Cell (page type 0x05):
//!   A 4-byte big-endian page number which is the left child pointer.
//!   A varint which is the integer key
//!
//! Index B-Tree Leaf Cell (page type 0x0a):
//!   A varint which is the total number of bytes of key payload, including any overflow
//!   The initial portion of the payload that does not spill to overflow pages.
//!   A 4-byte big-endian overflow page number - omitted if the payload fits.
//!
//! Index B-Tree Interior Cell (page type 0x02):
//!   A 4-byte big-endian page number which is the left child pointer.
//!   A varint which is the total number of bytes of key payload
//!   The initial portion of the payload that does not spill to overflow pages.
//!   A 4-byte big-endian overflow page number - omitted if the payload fits.

use byteorder::{BigEndian, ByteOrder};

use super::{corrupt, Error, PageType};
use crate::pager::PageNum;
use crate::varint;

/// How much of a `payload_size`-byte payload stays inline on a table leaf
/// of usable size `usable`.
///
/// Let X be U-35.  If the payload size P is less than or equal to X then
/// the entire payload is stored inline.  Otherwise let M be ((U-12)*32/255)-23
/// and K be M+((P-M)%(U-4)).  The inline portion is K if K is less or equal
/// to X, or M otherwise.
pub fn table_leaf_inline_size(usable: u32, payload_size: usize) -> usize {
    let u = usable as usize;
    let x = u - 35;
    inline_size(u, x, payload_size)
}

/// The index-page variant: X is ((U-12)*64/255)-23, applying to both index
/// leaves and index interiors.
pub fn index_inline_size(usable: u32, payload_size: usize) -> usize {
    let u = usable as usize;
    let x = (u - 12) * 64 / 255 - 23;
    inline_size(u, x, payload_size)
}

fn inline_size(u: usize, x: usize, p: usize) -> usize {
    if p <= x {
        return p;
    }
    let m = (u - 12) * 32 / 255 - 23;
    let k = m + (p - m) % (u - 4);
    if k <= x {
        k
    } else {
        m
    }
}

pub fn inline_size_for(page_type: PageType, usable: u32, payload_size: usize) -> usize {
    match page_type {
        PageType::TableLeaf => table_leaf_inline_size(usable, payload_size),
        PageType::IndexLeaf | PageType::IndexInterior => index_inline_size(usable, payload_size),
        PageType::TableInterior => 0,
    }
}

/// A parsed cell.  `inline_payload` borrows from the page; table interior
/// cells have no payload, table leaf cells have a rowid.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell<'a> {
    pub left_child: Option<u32>,
    pub rowid: Option<i64>,
    pub payload_size: usize,
    pub inline_payload: &'a [u8],
    pub overflow_page: Option<u32>,
    /// Total bytes this cell occupies on the page.
    pub cell_size: usize,
}

/// Parse the cell starting at `cell[0]`, which lies on a page of kind
/// `page_type`.  `pn` is for error attribution only.
pub fn parse_cell<'a>(
    cell: &'a [u8],
    page_type: PageType,
    usable: u32,
    pn: PageNum,
) -> Result<Cell<'a>, Error> {
    let mut offset = 0;
    let left_child = if page_type.is_leaf() {
        None
    } else {
        if cell.len() < 4 {
            return Err(corrupt(pn, "interior cell too short for child pointer"));
        }
        let child = BigEndian::read_u32(&cell[0..4]);
        offset = 4;
        Some(child)
    };

    if page_type == PageType::TableInterior {
        let (rowid, n) =
            varint::read(&cell[offset..]).ok_or_else(|| corrupt(pn, "truncated cell varint"))?;
        return Ok(Cell {
            left_child,
            rowid: Some(rowid),
            payload_size: 0,
            inline_payload: &[],
            overflow_page: None,
            cell_size: offset + n,
        });
    }

    let (payload_size, n) =
        varint::read(&cell[offset..]).ok_or_else(|| corrupt(pn, "truncated cell varint"))?;
    offset += n;
    if payload_size < 0 {
        return Err(corrupt(pn, "negative payload size"));
    }
    let payload_size = payload_size as usize;

    let rowid = if page_type == PageType::TableLeaf {
        let (rowid, n) =
            varint::read(&cell[offset..]).ok_or_else(|| corrupt(pn, "truncated rowid varint"))?;
        offset += n;
        Some(rowid)
    } else {
        None
    };

    let inline = inline_size_for(page_type, usable, payload_size);
    if cell.len() < offset + inline {
        return Err(corrupt(pn, "cell payload extends past page end"));
    }
    let inline_payload = &cell[offset..offset + inline];
    offset += inline;

    let overflow_page = if inline < payload_size {
        if cell.len() < offset + 4 {
            return Err(corrupt(pn, "cell missing overflow pointer"));
        }
        let first = BigEndian::read_u32(&cell[offset..offset + 4]);
        offset += 4;
        Some(first)
    } else {
        None
    };

    Ok(Cell {
        left_child,
        rowid,
        payload_size,
        inline_payload,
        overflow_page,
        cell_size: offset,
    })
}

/// Serialize a table leaf cell.  `inline` must already be the correctly
/// sized inline prefix of the payload.
pub fn build_table_leaf_cell(
    rowid: i64,
    payload_size: usize,
    inline: &[u8],
    overflow_page: Option<u32>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(inline.len() + 22);
    varint::push(payload_size as i64, &mut out);
    varint::push(rowid, &mut out);
    out.extend_from_slice(inline);
    if let Some(pn) = overflow_page {
        out.extend_from_slice(&pn.to_be_bytes());
    }
    out
}

pub fn build_table_interior_cell(left_child: u32, rowid: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.extend_from_slice(&left_child.to_be_bytes());
    varint::push(rowid, &mut out);
    out
}

pub fn build_index_leaf_cell(
    payload_size: usize,
    inline: &[u8],
    overflow_page: Option<u32>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(inline.len() + 13);
    varint::push(payload_size as i64, &mut out);
    out.extend_from_slice(inline);
    if let Some(pn) = overflow_page {
        out.extend_from_slice(&pn.to_be_bytes());
    }
    out
}

pub fn build_index_interior_cell(
    left_child: u32,
    payload_size: usize,
    inline: &[u8],
    overflow_page: Option<u32>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(inline.len() + 17);
    out.extend_from_slice(&left_child.to_be_bytes());
    varint::push(payload_size as i64, &mut out);
    out.extend_from_slice(inline);
    if let Some(pn) = overflow_page {
        out.extend_from_slice(&pn.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_threshold() {
        // Payloads at or under X = U-35 stay fully inline.
        let u = 4096u32;
        let x = 4096 - 35;
        assert_eq!(table_leaf_inline_size(u, x as usize), x as usize);
        // One byte over spills.
        assert!(table_leaf_inline_size(u, x as usize + 1) < x as usize + 1);
    }

    #[test]
    fn test_inline_spill_formula() {
        // U=4096: M = ((4096-12)*32/255)-23 = 489.
        let m = (4096 - 12) * 32 / 255 - 23;
        assert_eq!(m, 489);
        // P = 20000: K = M + (P-M) % (U-4) = 489 + 19511 % 4092 = 489 + 3143.
        let k = m + (20000 - m) % 4092;
        assert_eq!(table_leaf_inline_size(4096, 20000), k);
        // A payload where K would exceed X falls back to M.
        let p = 4061 + 4092; // K = 489 + (p-489)%4092 = 489 + 3572 = 4061 = X
        assert_eq!(table_leaf_inline_size(4096, p), 4061);
        let p = p + 1; // K = 4062 > X
        assert_eq!(table_leaf_inline_size(4096, p), m);
    }

    #[test]
    fn test_table_leaf_cell_round_trip() {
        let payload = vec![0xABu8; 100];
        let bytes = build_table_leaf_cell(7, 100, &payload, None);
        let cell = parse_cell(&bytes, PageType::TableLeaf, 4096, 2).unwrap();
        assert_eq!(cell.rowid, Some(7));
        assert_eq!(cell.payload_size, 100);
        assert_eq!(cell.inline_payload, &payload[..]);
        assert_eq!(cell.overflow_page, None);
        assert_eq!(cell.cell_size, bytes.len());
    }

    #[test]
    fn test_table_leaf_cell_with_overflow() {
        let inline = table_leaf_inline_size(512, 20_000);
        let inline_bytes = vec![0x11u8; inline];
        let bytes = build_table_leaf_cell(1, 20_000, &inline_bytes, Some(42));
        let cell = parse_cell(&bytes, PageType::TableLeaf, 512, 2).unwrap();
        assert_eq!(cell.payload_size, 20_000);
        assert_eq!(cell.inline_payload.len(), inline);
        assert_eq!(cell.overflow_page, Some(42));
    }

    #[test]
    fn test_table_interior_cell_round_trip() {
        let bytes = build_table_interior_cell(9, -3);
        let cell = parse_cell(&bytes, PageType::TableInterior, 4096, 2).unwrap();
        assert_eq!(cell.left_child, Some(9));
        assert_eq!(cell.rowid, Some(-3));
        assert_eq!(cell.cell_size, bytes.len());
    }

    #[test]
    fn test_index_cells_round_trip() {
        let key = b"hello index key";
        let leaf = build_index_leaf_cell(key.len(), key, None);
        let cell = parse_cell(&leaf, PageType::IndexLeaf, 4096, 3).unwrap();
        assert_eq!(cell.inline_payload, key);
        assert_eq!(cell.left_child, None);

        let interior = build_index_interior_cell(4, key.len(), key, None);
        let cell = parse_cell(&interior, PageType::IndexInterior, 4096, 3).unwrap();
        assert_eq!(cell.inline_payload, key);
        assert_eq!(cell.left_child, Some(4));
    }

    #[test]
    fn test_truncated_cell_is_corrupt() {
        let bytes = build_table_leaf_cell(7, 100, &[0xAB; 100], None);
        assert!(matches!(
            parse_cell(&bytes[..40], PageType::TableLeaf, 4096, 2),
            Err(Error::CorruptPage { .. })
        ));
    }
}
