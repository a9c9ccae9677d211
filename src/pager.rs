//! Manages pages from a database file as defined at https://www.sqlite.org/fileformat.html
//!
//! The pager owns the file handle for one open database and hands out pages
//! by 1-based page number.  Reads go through an LRU cache of plaintext
//! pages; a miss reads (and, on an encrypted file, decrypts) from disk.
//! Cache slots are shared `Rc` buffers, so a page view handed to a caller
//! stays valid even if the slot is evicted or overwritten underneath it.
//!
//! On an encrypted file every logical page occupies a fixed-size block of
//! `page_size + 28` bytes starting after the 128-byte encryption header;
//! the pager translates addresses accordingly.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use log::trace;

use crate::crypto::{self, PageCodec};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Pager: page number {0} is 0 or beyond the file extent.")]
    InvalidPageNumber(PageNum),
    #[error("Pager: file ends mid-page at page {0}.")]
    ShortRead(PageNum),
    #[error("Pager: the database is open read-only.")]
    ReadOnly,
    #[error("Pager: error accessing database file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Pager: {0}")]
    Crypto(#[from] crypto::Error),
}

// Page numbers are 1-based, to match how Sqlite numbers pages.  PageNum
// ensures people pass something that is meant to be a page number to a
// function that expects a page number.
pub type PageNum = usize;

/// A shared read-only view of one page.  Cheap to clone; keeps the bytes
/// alive independent of the cache.
pub type PageRef = Rc<[u8]>;

/// A read-only page view that is either a shared cache slot or a borrow
/// (the shadow overlay lends its dirty buffers this way).
pub enum PageBytes<'a> {
    Shared(PageRef),
    Borrowed(&'a [u8]),
}

impl<'a> std::ops::Deref for PageBytes<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PageBytes::Shared(p) => p,
            PageBytes::Borrowed(b) => b,
        }
    }
}

/// Default LRU capacity: 16384 slots, about 64 MiB at 4 KiB pages.
pub const DEFAULT_CACHE_SIZE_PAGES: usize = 16_384;

struct Slot {
    data: PageRef,
    stamp: u64,
}

struct Cache {
    slots: HashMap<PageNum, Slot>,
    capacity: usize,
    clock: u64,
}

impl Cache {
    fn new(capacity: usize) -> Cache {
        Cache {
            slots: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    fn get(&mut self, pn: PageNum) -> Option<PageRef> {
        self.clock += 1;
        let clock = self.clock;
        self.slots.get_mut(&pn).map(|s| {
            s.stamp = clock;
            Rc::clone(&s.data)
        })
    }

    fn put(&mut self, pn: PageNum, data: PageRef) {
        self.clock += 1;
        if self.slots.len() >= self.capacity && !self.slots.contains_key(&pn) {
            // Evict the least recently used slot.  Outstanding PageRefs keep
            // their bytes alive; only the slot is reclaimed.
            if let Some(&victim) = self
                .slots
                .iter()
                .min_by_key(|(_, s)| s.stamp)
                .map(|(pn, _)| pn)
            {
                self.slots.remove(&victim);
            }
        }
        self.slots.insert(
            pn,
            Slot {
                data,
                stamp: self.clock,
            },
        );
    }

    fn remove(&mut self, pn: PageNum) {
        self.slots.remove(&pn);
    }
}

/// A `Pager` manages file access and page memory for one open database file.
pub struct Pager {
    f: RefCell<File>,
    cache: RefCell<Cache>,
    page_size: u32,
    page_count: Cell<u32>,
    writable: bool,
    codec: Option<PageCodec>,
}

impl Pager {
    /// Wrap an already-validated file.  `page_count` comes from the parsed
    /// database header (or 0 for a file being created); on an encrypted
    /// database the 128-byte encryption header has already been written or
    /// parsed by the caller.
    pub fn from_file(
        f: File,
        page_size: u32,
        page_count: u32,
        writable: bool,
        codec: Option<PageCodec>,
        cache_size_pages: usize,
    ) -> Pager {
        Pager {
            f: RefCell::new(f),
            cache: RefCell::new(Cache::new(cache_size_pages)),
            page_size,
            page_count: Cell::new(page_count),
            writable,
            codec,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.get()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_encrypted(&self) -> bool {
        self.codec.is_some()
    }

    /// The master key, when this database is encrypted.
    pub fn codec(&self) -> Option<&PageCodec> {
        self.codec.as_ref()
    }

    /// The on-disk block size of one logical page.
    fn block_size(&self) -> u64 {
        match &self.codec {
            Some(_) => self.page_size as u64 + crypto::page::TRANSFORM_OVERHEAD as u64,
            None => self.page_size as u64,
        }
    }

    /// File offset of page `pn`'s block.
    fn block_offset(&self, pn: PageNum) -> u64 {
        let base = match &self.codec {
            Some(_) => crypto::header::ENCRYPTION_HEADER_BYTES as u64,
            None => 0,
        };
        base + (pn as u64 - 1) * self.block_size()
    }

    fn check_page_number(&self, pn: PageNum) -> Result<(), Error> {
        if pn == 0 || pn > self.page_count.get() as PageNum {
            return Err(Error::InvalidPageNumber(pn));
        }
        Ok(())
    }

    fn read_block_from_file(&self, pn: PageNum) -> Result<Vec<u8>, Error> {
        let mut block = vec![0_u8; self.block_size() as usize];
        let mut f = self.f.borrow_mut();
        f.seek(SeekFrom::Start(self.block_offset(pn)))?;
        f.read_exact(&mut block[..]).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::ShortRead(pn)
            } else {
                Error::Io(e)
            }
        })?;
        Ok(block)
    }

    fn load_page(&self, pn: PageNum) -> Result<PageRef, Error> {
        trace!("pager: filling page {} from file", pn);
        let block = self.read_block_from_file(pn)?;
        let plain: Vec<u8> = match &self.codec {
            Some(codec) => codec.transform_read(&block, pn as u32)?,
            None => block,
        };
        Ok(Rc::from(plain.into_boxed_slice()))
    }

    /// Get a shared read-only view of page `pn`.
    ///
    /// Reads past the current page count fail rather than returning zeros.
    pub fn get_page(&self, pn: PageNum) -> Result<PageRef, Error> {
        self.check_page_number(pn)?;
        if let Some(hit) = self.cache.borrow_mut().get(pn) {
            return Ok(hit);
        }
        let page = self.load_page(pn)?;
        self.cache.borrow_mut().put(pn, Rc::clone(&page));
        Ok(page)
    }

    /// Copy page `pn` into a caller buffer of exactly `page_size` bytes.
    pub fn read_page(&self, pn: PageNum, dst: &mut [u8]) -> Result<(), Error> {
        let page = self.get_page(pn)?;
        dst.copy_from_slice(&page);
        Ok(())
    }

    /// Overwrite page `pn` (which must already exist) and refresh the cache.
    pub fn write_page(&self, pn: PageNum, src: &[u8]) -> Result<(), Error> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.check_page_number(pn)?;
        assert_eq!(src.len(), self.page_size as usize);
        let block: Vec<u8> = match &self.codec {
            Some(codec) => codec.transform_write(src, pn as u32)?,
            None => src.to_vec(),
        };
        {
            let mut f = self.f.borrow_mut();
            f.seek(SeekFrom::Start(self.block_offset(pn)))?;
            f.write_all(&block)?;
        }
        self.cache
            .borrow_mut()
            .put(pn, Rc::from(src.to_vec().into_boxed_slice()));
        Ok(())
    }

    /// Grow the file by `additional` zeroed pages.
    pub fn extend(&self, additional: u32) -> Result<(), Error> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let zero = vec![0_u8; self.page_size as usize];
        for _ in 0..additional {
            let pn = self.page_count.get() as PageNum + 1;
            let block: Vec<u8> = match &self.codec {
                Some(codec) => codec.transform_write(&zero, pn as u32)?,
                None => zero.clone(),
            };
            let mut f = self.f.borrow_mut();
            f.seek(SeekFrom::Start(self.block_offset(pn)))?;
            f.write_all(&block)?;
            drop(f);
            self.page_count.set(pn as u32);
        }
        Ok(())
    }

    /// Shrink the file to exactly `pages` pages.
    pub fn truncate(&self, pages: u32) -> Result<(), Error> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let end = self.block_offset(pages as PageNum + 1);
        self.f.borrow_mut().set_len(end)?;
        let mut cache = self.cache.borrow_mut();
        for pn in (pages as PageNum + 1)..=(self.page_count.get() as PageNum) {
            cache.remove(pn);
        }
        self.page_count.set(pages);
        Ok(())
    }

    /// Make everything written so far durable on the device.
    pub fn flush(&self) -> Result<(), Error> {
        self.f.borrow_mut().sync_all()?;
        Ok(())
    }

    /// Discard any cached copy of page `pn`.
    pub fn invalidate(&self, pn: PageNum) {
        self.cache.borrow_mut().remove(pn);
    }

    /// Discard the whole cache (another process committed under us).
    pub fn invalidate_all(&self) {
        let mut cache = self.cache.borrow_mut();
        let capacity = cache.capacity;
        *cache = Cache::new(capacity);
    }

    /// Adopt the page count parsed from the database header, which is
    /// authoritative over the raw file extent.
    pub(crate) fn set_page_count(&self, pages: u32) {
        self.page_count.set(pages);
    }
}
