//! payload assembles and writes the overflow chains that hold the part of
//! a cell's payload that does not fit inline.
//!
//! An overflow page is a 4-byte big-endian next-page pointer (0 terminates
//! the list) followed by up to `usable - 4` payload bytes.  The chain
//! length is fully determined by the payload size; a chain that ends early
//! or loops is corrupt.

use byteorder::{BigEndian, ByteOrder};

use super::{corrupt, Error, PageSource};
use crate::freelist::Freelist;
use crate::pager::PageNum;
use crate::shadow::ShadowPageSource;

/// Assemble a logical payload: the inline prefix plus the overflow chain
/// starting at `first_overflow`.  Returns the full `payload_size` bytes.
pub fn assemble<S: PageSource>(
    source: &S,
    payload_size: usize,
    inline: &[u8],
    first_overflow: Option<u32>,
    pn: PageNum,
) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(payload_size);
    out.extend_from_slice(inline);
    let usable = source.usable_size() as usize;
    let per_page = usable - 4;

    let mut next = first_overflow.unwrap_or(0);
    // The chain is bounded by the payload size; seeing more pages than the
    // remainder needs means a cycle.
    let max_pages = payload_size.saturating_sub(inline.len()).div_ceil(per_page);
    let mut visited = 0usize;
    while out.len() < payload_size {
        if next == 0 {
            return Err(corrupt(pn, "overflow chain ends before payload is complete"));
        }
        if visited >= max_pages {
            return Err(corrupt(pn, "overflow chain longer than payload (cycle?)"));
        }
        visited += 1;
        let page = source.page(next as PageNum)?;
        let take = (payload_size - out.len()).min(per_page);
        out.extend_from_slice(&page[4..4 + take]);
        next = BigEndian::read_u32(&page[0..4]);
    }
    Ok(out)
}

/// Number of overflow pages a payload needs on pages of `usable` bytes.
pub fn chain_length(payload_size: usize, inline: usize, usable: u32) -> usize {
    payload_size
        .saturating_sub(inline)
        .div_ceil(usable as usize - 4)
}

/// Write the non-inline remainder of a payload into a fresh overflow chain,
/// allocating pages from the freelist first and by extension second.
/// Returns the first page of the chain.
pub fn write_chain(
    shadow: &mut ShadowPageSource,
    freelist: &mut Freelist,
    tail: &[u8],
) -> Result<u32, Error> {
    debug_assert!(!tail.is_empty());
    let per_page = shadow.page_size() as usize - 4;
    let pages: Vec<PageNum> = (0..tail.len().div_ceil(per_page))
        .map(|_| freelist.allocate(shadow))
        .collect::<Result<_, _>>()?;

    for (i, chunk) in tail.chunks(per_page).enumerate() {
        let next = pages.get(i + 1).copied().unwrap_or(0);
        let page = shadow.page_mut(pages[i])?;
        page.fill(0);
        BigEndian::write_u32(&mut page[0..4], next as u32);
        page[4..4 + chunk.len()].copy_from_slice(chunk);
    }
    Ok(pages[0] as u32)
}

/// Push every page of an overflow chain onto the freelist.
pub fn free_chain(
    shadow: &mut ShadowPageSource,
    freelist: &mut Freelist,
    first: u32,
    payload_size: usize,
    inline: usize,
    pn: PageNum,
) -> Result<(), Error> {
    let max_pages = chain_length(payload_size, inline, shadow.page_size());
    let mut next = first;
    let mut freed = 0usize;
    while next != 0 {
        if freed >= max_pages {
            return Err(corrupt(pn, "overflow chain longer than payload (cycle?)"));
        }
        let following = {
            let page = super::PageSource::page(shadow, next as PageNum)?;
            BigEndian::read_u32(&page[0..4])
        };
        freelist.push(shadow, next as PageNum)?;
        freed += 1;
        next = following;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{Journal, JournalMode};
    use crate::pager::Pager;

    fn scratch(pages: u32) -> (tempfile::TempDir, Pager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ovfl.db");
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
    fn test_write_then_assemble() {
        let (_dir, pager) = scratch(2);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);

        let payload: Vec<u8> = (0..2000u32).map(|i| (i * 31 % 256) as u8).collect();
        let inline = 100;
        let first = write_chain(&mut shadow, &mut fl, &payload[inline..]).unwrap();
        assert_eq!(
            shadow.page_count() as usize,
            2 + chain_length(payload.len(), inline, 512)
        );

        let assembled = assemble(
            &shadow,
            payload.len(),
            &payload[..inline],
            Some(first),
            1,
        )
        .unwrap();
        assert_eq!(assembled, payload);
    }

    #[test]
    fn test_chain_length_is_exact() {
        // 1900 tail bytes at 508 per page: 4 pages.
        assert_eq!(chain_length(2000, 100, 512), 4);
        // Exactly divisible.
        assert_eq!(chain_length(100 + 508 * 3, 100, 512), 3);
        // Fully inline payloads need no chain.
        assert_eq!(chain_length(100, 100, 512), 0);
    }

    #[test]
    fn test_premature_end_is_corrupt() {
        let (_dir, pager) = scratch(2);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let tail = vec![7u8; 600]; // needs 2 pages
        let first = write_chain(&mut shadow, &mut fl, &tail).unwrap();
        // Zero the next pointer of the first chain page.
        let page = shadow.page_mut(first as PageNum).unwrap();
        BigEndian::write_u32(&mut page[0..4], 0);
        let got = assemble(&shadow, 700, &[0u8; 100], Some(first), 1);
        assert!(matches!(got, Err(Error::CorruptPage { .. })));
    }

    #[test]
    fn test_cycle_is_corrupt() {
        let (_dir, pager) = scratch(2);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let tail = vec![7u8; 600];
        let first = write_chain(&mut shadow, &mut fl, &tail).unwrap();
        // Point the first chain page back at itself.
        let page = shadow.page_mut(first as PageNum).unwrap();
        BigEndian::write_u32(&mut page[0..4], first);
        let got = assemble(&shadow, 700, &[0u8; 100], Some(first), 1);
        assert!(matches!(got, Err(Error::CorruptPage { .. })));
    }

    #[test]
    fn test_free_chain_returns_pages() {
        let (_dir, pager) = scratch(2);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let tail = vec![9u8; 1200];
        let first = write_chain(&mut shadow, &mut fl, &tail).unwrap();
        assert_eq!(fl.count, 0);
        free_chain(&mut shadow, &mut fl, first, 1300, 100, 1).unwrap();
        assert_eq!(fl.count, 3);
    }
}
