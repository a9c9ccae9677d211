//! dbheader reads and writes the 100-byte header at the start of a database
//! file, defined at https://www.sqlite.org/fileformat.html#the_database_header

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("The magic bytes for this file are wrong.")]
    WrongMagic,
    #[error("The pagesize is not a power of two between 512 and 65536.")]
    UnsupportedPagesize,
    #[error("The text encoding is not UTF-8.")]
    UnsupportedTextEncoding,
    #[error("A field value is not supported by this code, though it may be valid Sqlite format: {0}")]
    Unsupported(&'static str),
    #[error("A field value is invalid per the Sqlite format spec (version 3.0.0).")]
    Invalid,
    #[error("Error reading file.")]
    ReadFailed,
}

pub const SQLITE_DB_HEADER_BYTES: usize = 100;
const SQLITE3_MAGIC_STRING: &[u8] = b"SQLite format 3\0";
const SQLITE_VERSION_NUMBER: u32 = 3037000;

// Field offsets within the header, for in-place patches of page 1.
pub const OFFSET_CHANGE_COUNTER: usize = 24;
pub const OFFSET_PAGE_COUNT: usize = 28;
pub const OFFSET_FREELIST_HEAD: usize = 32;
pub const OFFSET_FREELIST_COUNT: usize = 36;
pub const OFFSET_SCHEMA_COOKIE: usize = 40;
pub const OFFSET_VERSION_VALID_FOR: usize = 92;

// The database file header.
#[derive(Debug, Clone, PartialEq)]
pub struct DbfileHeader {
    pub pagesize: u32,
    pub reserved_bytes_per_page: u8,
    pub changecnt: u32,
    pub numpages: u32,
    pub freelist_head: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub user_version: u32,
}

impl DbfileHeader {
    /// A header for a freshly created database of `pagesize` with a single
    /// (schema root) page.
    pub fn new(pagesize: u32) -> DbfileHeader {
        DbfileHeader {
            pagesize,
            reserved_bytes_per_page: 0,
            changecnt: 1,
            numpages: 1,
            freelist_head: 0,
            freelist_count: 0,
            schema_cookie: 1,
            user_version: 0,
        }
    }

    /// The usable bytes per page (pagesize minus trailing reserved region).
    pub fn usable_size(&self) -> u32 {
        self.pagesize - self.reserved_bytes_per_page as u32
    }
}

/// Parse a header from the first 100 bytes of page 1.
pub fn parse_header(bytes: &[u8]) -> Result<DbfileHeader, Error> {
    if bytes.len() < SQLITE_DB_HEADER_BYTES {
        return Err(Error::ReadFailed);
    }
    let mut f = Cursor::new(bytes);
    // Offset   Size    Description
    // 0        16      The header string: "SQLite format 3\000"
    let mut fileid_buffer = [0; 16];
    f.read_exact(&mut fileid_buffer)
        .map_err(|_| Error::ReadFailed)?;
    if fileid_buffer != SQLITE3_MAGIC_STRING {
        return Err(Error::WrongMagic);
    }

    // Offset   Size    Description
    // 16       2       The database page size in bytes. Must be a power of two between 512
    //                  and 32768 inclusive, or the value 1 representing a page size of 65536.
    let pagesize: u32 = match f.read_u16::<BigEndian>().map_err(|_| Error::ReadFailed)? {
        1 => 65536,
        x if (512..=32768).contains(&x) && x.is_power_of_two() => x as u32,
        _ => return Err(Error::UnsupportedPagesize),
    };

    // Offset   Size    Description
    // 18       1       File format write version. 1 for legacy; 2 for WAL.
    // 19       1       File format read version. 1 for legacy; 2 for WAL.
    if f.read_u8().map_err(|_| Error::ReadFailed)? != 0x01 {
        return Err(Error::Unsupported("write version"));
    }
    if f.read_u8().map_err(|_| Error::ReadFailed)? != 0x01 {
        return Err(Error::Unsupported("read version"));
    }

    // Offset   Size    Description
    // 20       1       Bytes of unused "reserved" space at the end of each page. Usually 0.
    // 21       1       Maximum embedded payload fraction. Must be 64.
    // 22       1       Minimum embedded payload fraction. Must be 32.
    // 23       1       Leaf payload fraction. Must be 32.
    let reserved_bytes_per_page = f.read_u8().map_err(|_| Error::ReadFailed)?;
    if f.read_u8().map_err(|_| Error::ReadFailed)? != 0x40 {
        return Err(Error::Invalid);
    }
    if f.read_u8().map_err(|_| Error::ReadFailed)? != 0x20 {
        return Err(Error::Invalid);
    }
    if f.read_u8().map_err(|_| Error::ReadFailed)? != 0x20 {
        return Err(Error::Invalid);
    }

    // Offset   Size    Description
    // 24       4       File change counter.
    // 28       4       Size of the database file in pages. The "in-header database size".
    // 32       4       Page number of the first freelist trunk page.
    // 36       4       Total number of freelist pages.
    // 40       4       The schema cookie.
    // 44       4       The schema format number. Supported schema formats are 1, 2, 3, and 4.
    let changecnt = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let numpages = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let freelist_head = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let freelist_count = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let schema_cookie = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    if !(1..=4).contains(&f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?) {
        return Err(Error::Unsupported("schema format"));
    }

    // Offset   Size    Description
    // 48       4       Default page cache size.
    // 52       4       Largest root b-tree page when in auto-vacuum modes, or zero.
    // 56       4       The database text encoding. A value of 1 means UTF-8.
    // 60       4       The "user version" as read and set by the user_version pragma.
    // 64       4       True (non-zero) for incremental-vacuum mode.
    let _default_cache_size = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    if f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)? != 0 {
        return Err(Error::Unsupported("auto-vacuum"));
    }
    if f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)? != 1 {
        return Err(Error::UnsupportedTextEncoding);
    }
    let user_version = f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    if f.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)? != 0 {
        return Err(Error::Unsupported("incremental-vacuum"));
    }

    // The remaining fields (application id, the 20 reserved bytes,
    // version-valid-for, library version) do not affect how the file is
    // read; files written by other libraries keep whatever they put there.

    Ok(DbfileHeader {
        pagesize,
        reserved_bytes_per_page,
        changecnt,
        numpages,
        freelist_head,
        freelist_count,
        schema_cookie,
        user_version,
    })
}

/// Serialize a header into the first 100 bytes of `page1`.
pub fn write_header(h: &DbfileHeader, page1: &mut [u8]) {
    let mut c = Cursor::new(&mut page1[..SQLITE_DB_HEADER_BYTES]);
    c.write_all(SQLITE3_MAGIC_STRING).unwrap();
    let pagesize_field: u16 = if h.pagesize == 65536 { 1 } else { h.pagesize as u16 };
    c.write_u16::<BigEndian>(pagesize_field).unwrap();
    c.write_u8(1).unwrap(); // file format write version: legacy
    c.write_u8(1).unwrap(); // file format read version: legacy
    c.write_u8(h.reserved_bytes_per_page).unwrap();
    c.write_u8(0x40).unwrap(); // max embedded payload fraction
    c.write_u8(0x20).unwrap(); // min embedded payload fraction
    c.write_u8(0x20).unwrap(); // leaf payload fraction
    c.write_u32::<BigEndian>(h.changecnt).unwrap();
    c.write_u32::<BigEndian>(h.numpages).unwrap();
    c.write_u32::<BigEndian>(h.freelist_head).unwrap();
    c.write_u32::<BigEndian>(h.freelist_count).unwrap();
    c.write_u32::<BigEndian>(h.schema_cookie).unwrap();
    c.write_u32::<BigEndian>(4).unwrap(); // schema format
    c.write_u32::<BigEndian>(0).unwrap(); // default page cache size
    c.write_u32::<BigEndian>(0).unwrap(); // largest root page (no auto-vacuum)
    c.write_u32::<BigEndian>(1).unwrap(); // text encoding: UTF-8
    c.write_u32::<BigEndian>(h.user_version).unwrap();
    c.write_u32::<BigEndian>(0).unwrap(); // incremental vacuum
    c.write_u32::<BigEndian>(0).unwrap(); // application id
    c.write_all(&[0u8; 20]).unwrap(); // reserved for expansion
    c.write_u32::<BigEndian>(h.changecnt).unwrap(); // version-valid-for
    c.write_u32::<BigEndian>(SQLITE_VERSION_NUMBER).unwrap();
}

/// Patch one big-endian u32 header field in a page-1 buffer.
pub fn patch_u32(page1: &mut [u8], offset: usize, value: u32) {
    BigEndian::write_u32(&mut page1[offset..offset + 4], value);
}

/// Read one big-endian u32 header field from a page-1 buffer.
pub fn read_u32(page1: &[u8], offset: usize) -> u32 {
    BigEndian::read_u32(&page1[offset..offset + 4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let h = DbfileHeader {
            pagesize: 4096,
            reserved_bytes_per_page: 0,
            changecnt: 7,
            numpages: 12,
            freelist_head: 9,
            freelist_count: 3,
            schema_cookie: 2,
            user_version: 5,
        };
        let mut page = vec![0u8; 4096];
        write_header(&h, &mut page);
        assert_eq!(parse_header(&page).unwrap(), h);
    }

    #[test]
    fn test_pagesize_special_encoding() {
        let h = DbfileHeader::new(65536);
        let mut page = vec![0u8; SQLITE_DB_HEADER_BYTES];
        write_header(&h, &mut page);
        assert_eq!(BigEndian::read_u16(&page[16..18]), 1);
        assert_eq!(parse_header(&page).unwrap().pagesize, 65536);
    }

    #[test]
    fn test_bad_magic() {
        let mut page = vec![0u8; SQLITE_DB_HEADER_BYTES];
        write_header(&DbfileHeader::new(4096), &mut page);
        page[0] = b'X';
        assert_eq!(parse_header(&page), Err(Error::WrongMagic));
    }

    #[test]
    fn test_bad_pagesize() {
        let mut page = vec![0u8; SQLITE_DB_HEADER_BYTES];
        write_header(&DbfileHeader::new(4096), &mut page);
        BigEndian::write_u16(&mut page[16..18], 1000);
        assert_eq!(parse_header(&page), Err(Error::UnsupportedPagesize));
    }

    #[test]
    fn test_patch_fields() {
        let mut page = vec![0u8; SQLITE_DB_HEADER_BYTES];
        write_header(&DbfileHeader::new(4096), &mut page);
        patch_u32(&mut page, OFFSET_PAGE_COUNT, 44);
        patch_u32(&mut page, OFFSET_FREELIST_HEAD, 7);
        let h = parse_header(&page).unwrap();
        assert_eq!(h.numpages, 44);
        assert_eq!(h.freelist_head, 7);
    }
}
