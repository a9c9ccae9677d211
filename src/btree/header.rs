//! header reads and writes the header of a btree page.
//! A b-tree page is divided into regions in the following order
//! 1. The 100-byte database file header (found on page 1 only)
//! 2. The 8 or 12 byte b-tree page header
//! 3. The cell pointer array
//! 4. Unallocated space
//! 5. The cell content area
//! 6. The reserved region (always 0 here)

use byteorder::{BigEndian, ByteOrder};

use super::{corrupt, Error, PageType};
use crate::pager::PageNum;

/// Bytes of non-btree content at the start of a page (the database file
/// header on page 1).
pub fn btree_start_offset(pn: PageNum) -> usize {
    match pn {
        1 => 100,
        _ => 0,
    }
}

// The btree page header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub freeblock_start: u16,
    pub num_cells: u16,
    pub cell_content_start: u32,
    pub fragmented_bytes: u8,
    pub rightmost_pointer: Option<u32>,
}

impl PageHeader {
    /// A header for a freshly initialized page with no cells.
    pub fn empty(page_type: PageType, usable_size: u32) -> PageHeader {
        PageHeader {
            page_type,
            freeblock_start: 0,
            num_cells: 0,
            cell_content_start: usable_size,
            fragmented_bytes: 0,
            rightmost_pointer: if page_type.is_leaf() { None } else { Some(0) },
        }
    }

    /// Byte length of this header on the page (8 for leaves, 12 interior).
    pub fn size(&self) -> usize {
        header_size(self.page_type)
    }

    /// Offset of the first byte past the cell pointer array.
    pub fn cell_pointer_array_end(&self, pn: PageNum) -> usize {
        btree_start_offset(pn) + self.size() + 2 * self.num_cells as usize
    }
}

pub fn header_size(page_type: PageType) -> usize {
    if page_type.is_leaf() {
        8
    } else {
        12
    }
}

pub fn parse_header(page: &[u8], pn: PageNum) -> Result<PageHeader, Error> {
    let offset = btree_start_offset(pn);
    if page.len() < offset + 8 {
        return Err(corrupt(pn, "page too small for a btree header"));
    }
    // Offset   Size    Description
    // 0        1       The one-byte flag at offset 0 indicating the b-tree page type.
    let page_type = PageType::from_flag(page[offset])
        .ok_or_else(|| corrupt(pn, "invalid btree page type flag"))?;
    // 1        2       Start of the first freeblock on the page, or zero.
    let freeblock_start = BigEndian::read_u16(&page[offset + 1..offset + 3]);
    // 3        2       The number of cells on the page.
    let num_cells = BigEndian::read_u16(&page[offset + 3..offset + 5]);
    // 5        2       Start of the cell content area. Zero is interpreted as 65536.
    let cell_content_start = match BigEndian::read_u16(&page[offset + 5..offset + 7]) {
        0 => 65536,
        x => x as u32,
    };
    // 7        1       The number of fragmented free bytes within the cell content area.
    let fragmented_bytes = page[offset + 7];
    // 8        4       The right-most pointer. Interior pages only.
    let rightmost_pointer = if page_type.is_leaf() {
        None
    } else {
        if page.len() < offset + 12 {
            return Err(corrupt(pn, "interior page too small for its header"));
        }
        Some(BigEndian::read_u32(&page[offset + 8..offset + 12]))
    };

    if cell_content_start as usize > page.len() {
        return Err(corrupt(pn, "cell content start beyond page end"));
    }

    Ok(PageHeader {
        page_type,
        freeblock_start,
        num_cells,
        cell_content_start,
        fragmented_bytes,
        rightmost_pointer,
    })
}

pub fn write_header(hdr: &PageHeader, page: &mut [u8], pn: PageNum) {
    let offset = btree_start_offset(pn);
    page[offset] = hdr.page_type.flag();
    BigEndian::write_u16(&mut page[offset + 1..offset + 3], hdr.freeblock_start);
    BigEndian::write_u16(&mut page[offset + 3..offset + 5], hdr.num_cells);
    let ccs_field: u16 = if hdr.cell_content_start == 65536 {
        0
    } else {
        hdr.cell_content_start as u16
    };
    BigEndian::write_u16(&mut page[offset + 5..offset + 7], ccs_field);
    page[offset + 7] = hdr.fragmented_bytes;
    if let Some(rmp) = hdr.rightmost_pointer {
        BigEndian::write_u32(&mut page[offset + 8..offset + 12], rmp);
    }
}

/// Read entry `i` of the cell pointer array.
pub fn cell_pointer(page: &[u8], hdr: &PageHeader, pn: PageNum, i: usize) -> usize {
    let base = btree_start_offset(pn) + hdr.size();
    BigEndian::read_u16(&page[base + 2 * i..base + 2 * i + 2]) as usize
}

/// Write entry `i` of the cell pointer array.
pub fn set_cell_pointer(page: &mut [u8], hdr: &PageHeader, pn: PageNum, i: usize, value: usize) {
    let base = btree_start_offset(pn) + hdr.size();
    BigEndian::write_u16(&mut page[base + 2 * i..base + 2 * i + 2], value as u16);
}
