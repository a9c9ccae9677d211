//! The freelist: a chain of trunk pages recording released pages available
//! for reuse without extending the file.
//!
//! Each trunk holds a 4-byte next-trunk pointer, a 4-byte leaf count, then
//! up to `(usable - 8) / 4` leaf page numbers.  The database header stores
//! the first trunk page and the total count (trunks plus leaves).  Reuse is
//! LIFO; nothing compacts or renumbers pages.

use byteorder::{BigEndian, ByteOrder};

use crate::pager::PageNum;
use crate::shadow::ShadowPageSource;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Shadow(#[from] crate::shadow::Error),
    #[error("Freelist: trunk page {0} is malformed.")]
    CorruptTrunk(PageNum),
}

/// In-memory freelist head state for one transaction; the writer seeds it
/// from the header at begin and writes it back at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freelist {
    pub head: u32,
    pub count: u32,
}

fn leaf_capacity(usable: u32) -> usize {
    (usable as usize - 8) / 4
}

impl Freelist {
    pub fn new(head: u32, count: u32) -> Freelist {
        Freelist { head, count }
    }

    /// Take a page off the freelist, or `None` when it is empty.
    pub fn pop(&mut self, shadow: &mut ShadowPageSource) -> Result<Option<PageNum>, Error> {
        if self.head == 0 {
            debug_assert_eq!(self.count, 0);
            return Ok(None);
        }
        let trunk_pn = self.head as PageNum;
        let (next, leaf_count) = {
            let trunk = shadow.page(trunk_pn)?;
            (
                BigEndian::read_u32(&trunk[0..4]),
                BigEndian::read_u32(&trunk[4..8]),
            )
        };
        if leaf_count as usize > leaf_capacity(shadow.page_size()) {
            return Err(Error::CorruptTrunk(trunk_pn));
        }
        if leaf_count > 0 {
            let offset = 8 + 4 * (leaf_count as usize - 1);
            let leaf = {
                let trunk = shadow.page(trunk_pn)?;
                BigEndian::read_u32(&trunk[offset..offset + 4])
            };
            let trunk = shadow.page_mut(trunk_pn)?;
            BigEndian::write_u32(&mut trunk[4..8], leaf_count - 1);
            self.count -= 1;
            Ok(Some(leaf as PageNum))
        } else {
            // The trunk itself is the reused page.
            self.head = next;
            self.count -= 1;
            Ok(Some(trunk_pn))
        }
    }

    /// Release a page onto the freelist.
    pub fn push(&mut self, shadow: &mut ShadowPageSource, pn: PageNum) -> Result<(), Error> {
        if self.head == 0 {
            Self::init_trunk(shadow, pn, 0)?;
            self.head = pn as u32;
            self.count += 1;
            return Ok(());
        }
        let trunk_pn = self.head as PageNum;
        let leaf_count = {
            let trunk = shadow.page(trunk_pn)?;
            BigEndian::read_u32(&trunk[4..8])
        };
        if (leaf_count as usize) < leaf_capacity(shadow.page_size()) {
            let trunk = shadow.page_mut(trunk_pn)?;
            let offset = 8 + 4 * leaf_count as usize;
            BigEndian::write_u32(&mut trunk[offset..offset + 4], pn as u32);
            BigEndian::write_u32(&mut trunk[4..8], leaf_count + 1);
        } else {
            // Current trunk is full; the pushed page becomes the new head.
            Self::init_trunk(shadow, pn, self.head)?;
            self.head = pn as u32;
        }
        self.count += 1;
        Ok(())
    }

    /// Allocate a page: freelist first, file extension second.
    pub fn allocate(&mut self, shadow: &mut ShadowPageSource) -> Result<PageNum, Error> {
        match self.pop(shadow)? {
            Some(pn) => {
                // Reused pages carry stale content; hand them out zeroed.
                shadow.page_mut(pn)?.fill(0);
                Ok(pn)
            }
            None => Ok(shadow.allocate_page()?),
        }
    }

    fn init_trunk(shadow: &mut ShadowPageSource, pn: PageNum, next: u32) -> Result<(), Error> {
        let page = shadow.page_mut(pn)?;
        page.fill(0);
        BigEndian::write_u32(&mut page[0..4], next);
        BigEndian::write_u32(&mut page[4..8], 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{Journal, JournalMode};
    use crate::pager::Pager;

    fn scratch(pages: u32) -> (tempfile::TempDir, Pager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fl.db");
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        f.set_len(pages as u64 * 512).unwrap();
        (dir, Pager::from_file(f, 512, pages, true, None, 8))
    }

    fn shadow(pager: &Pager) -> ShadowPageSource<'_> {
        let journal = Journal::create(
            std::path::Path::new("unused"),
            JournalMode::Memory,
            pager.page_size(),
            pager.page_count(),
        )
        .unwrap();
        ShadowPageSource::new(pager, journal)
    }

    #[test]
    fn test_pop_empty_is_none() {
        let (_dir, pager) = scratch(2);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        assert_eq!(fl.pop(&mut shadow).unwrap(), None);
    }

    #[test]
    fn test_push_pop_lifo() {
        let (_dir, pager) = scratch(8);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        for pn in [3usize, 5, 7] {
            fl.push(&mut shadow, pn).unwrap();
        }
        // Page 3 became the trunk; 5 and 7 are its leaves.
        assert_eq!(fl.head, 3);
        assert_eq!(fl.count, 3);
        assert_eq!(fl.pop(&mut shadow).unwrap(), Some(7));
        assert_eq!(fl.pop(&mut shadow).unwrap(), Some(5));
        assert_eq!(fl.pop(&mut shadow).unwrap(), Some(3));
        assert_eq!(fl.pop(&mut shadow).unwrap(), None);
        assert_eq!(fl.count, 0);
        assert_eq!(fl.head, 0);
    }

    #[test]
    fn test_full_trunk_starts_new_trunk() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let capacity = (512 - 8) / 4; // 126 leaves per trunk
        // One trunk, all its leaves, plus one more page.
        for pn in 2..(2 + capacity + 2) {
            fl.push(&mut shadow, pn).unwrap();
        }
        assert_eq!(fl.count as usize, capacity + 2);
        // The overflowing push became a new trunk chained to the old one.
        assert_eq!(fl.head as usize, 2 + capacity + 1);
        let trunk = shadow.page(fl.head as PageNum).unwrap();
        assert_eq!(BigEndian::read_u32(&trunk[0..4]), 2);
        assert_eq!(BigEndian::read_u32(&trunk[4..8]), 0);
    }

    #[test]
    fn test_count_matches_chain_shape() {
        let (_dir, pager) = scratch(64);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        for pn in 10..20 {
            fl.push(&mut shadow, pn).unwrap();
        }
        // Walk the chain: count == trunks + sum(leaf counts).
        let mut walked = 0u32;
        let mut trunk_pn = fl.head as PageNum;
        while trunk_pn != 0 {
            let trunk = shadow.page(trunk_pn).unwrap();
            walked += 1 + BigEndian::read_u32(&trunk[4..8]);
            trunk_pn = BigEndian::read_u32(&trunk[0..4]) as PageNum;
        }
        assert_eq!(walked, fl.count);
    }

    #[test]
    fn test_allocate_prefers_freelist_then_extends() {
        let (_dir, pager) = scratch(4);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        fl.push(&mut shadow, 3).unwrap();
        assert_eq!(fl.allocate(&mut shadow).unwrap(), 3);
        // Freelist empty: extend the file.
        assert_eq!(fl.allocate(&mut shadow).unwrap(), 5);
        assert_eq!(shadow.page_count(), 5);
    }
}
