//! A `ShadowPageSource` wraps the pager and buffers dirty pages in memory.
//! Reads prefer the shadow map, so a transaction sees its own writes;
//! nothing touches the file until commit flushes the map out.
//!
//! The first time a pre-existing page is dirtied, its pre-image goes to the
//! journal.  Pages allocated inside the transaction (beyond the snapshotted
//! page count) have no pre-image; rollback drops them with the shadow map.

use std::collections::{btree_map::Entry, BTreeMap};

use crate::journal::Journal;
use crate::pager::{PageBytes, PageNum, Pager};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Pager(#[from] crate::pager::Error),
    #[error("{0}")]
    Journal(#[from] crate::journal::Error),
}

pub struct ShadowPageSource<'p> {
    pager: &'p Pager,
    journal: Journal,
    /// Pages the file held when the transaction began; only these have
    /// pre-images worth journaling.
    base_page_count: u32,
    page_count: u32,
    dirty: BTreeMap<PageNum, Box<[u8]>>,
}

impl<'p> ShadowPageSource<'p> {
    pub fn new(pager: &'p Pager, journal: Journal) -> ShadowPageSource<'p> {
        let base_page_count = pager.page_count();
        ShadowPageSource {
            pager,
            journal,
            base_page_count,
            page_count: base_page_count,
            dirty: BTreeMap::new(),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.pager.page_size()
    }

    /// The transaction's logical page count, including pages allocated since
    /// begin.
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn base_page_count(&self) -> u32 {
        self.base_page_count
    }

    pub fn page(&self, pn: PageNum) -> Result<PageBytes<'_>, Error> {
        if let Some(dirty) = self.dirty.get(&pn) {
            return Ok(PageBytes::Borrowed(dirty));
        }
        Ok(PageBytes::Shared(self.pager.get_page(pn)?))
    }

    /// Copy-on-first-write access to page `pn`.  Capturing the pre-image
    /// into the journal happens here, before the caller can touch a byte.
    pub fn page_mut(&mut self, pn: PageNum) -> Result<&mut [u8], Error> {
        match self.dirty.entry(pn) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                if pn <= self.base_page_count as PageNum {
                    let page = self.pager.get_page(pn)?;
                    self.journal.capture(pn, &page)?;
                    Ok(entry.insert(page.to_vec().into_boxed_slice()))
                } else if pn <= self.page_count as PageNum {
                    // Allocated by this transaction; starts zeroed, nothing
                    // to journal.
                    let page_size = self.pager.page_size() as usize;
                    Ok(entry.insert(vec![0u8; page_size].into_boxed_slice()))
                } else {
                    Err(Error::Pager(crate::pager::Error::InvalidPageNumber(pn)))
                }
            }
        }
    }

    /// Extend the logical file by one zeroed page and return its number.
    pub fn allocate_page(&mut self) -> Result<PageNum, Error> {
        let pn = self.page_count as PageNum + 1;
        self.page_count = pn as u32;
        let page_size = self.pager.page_size() as usize;
        self.dirty.insert(pn, vec![0u8; page_size].into_boxed_slice());
        Ok(pn)
    }

    /// Flush the shadow map through the pager: make the journal durable,
    /// grow the file if the transaction allocated pages, write every dirty
    /// page, then flush the device.  The journal is returned to the caller,
    /// whose deletion of it commits the transaction.
    pub fn flush_to_pager(mut self) -> Result<Journal, Error> {
        self.journal.sync()?;
        if self.page_count > self.pager.page_count() {
            self.pager.extend(self.page_count - self.pager.page_count())?;
        }
        for (pn, page) in &self.dirty {
            self.pager.write_page(*pn, page)?;
        }
        self.pager.flush()?;
        Ok(self.journal)
    }

    /// Abandon the shadow map.  Nothing reached the file, so the journal is
    /// all there is to clean up.
    pub fn discard(self) -> Journal {
        self.journal
    }

    pub fn dirty_page_count(&self) -> usize {
        self.dirty.len()
    }
}
