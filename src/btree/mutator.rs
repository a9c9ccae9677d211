//! mutator edits one btree rooted at a given page: insert, update and
//! delete, with page splits and rebalancing.
//!
//! All edits go through the transaction's shadow overlay, so pre-images
//! reach the journal before a byte changes and nothing touches the file
//! until commit.  The descent records an explicit stack of
//! `(page, child slot)` frames which doubles as the split propagation path.
//!
//! Space inside a page is managed the way the file format describes it:
//! cells grow down from the page end, freed regions join a sorted
//! freeblock chain (coalescing neighbors), sub-4-byte remainders become
//! fragment bytes, and a page is defragmented when its free space is
//! sufficient but not contiguous.

use byteorder::{BigEndian, ByteOrder};
use log::trace;

use super::cell;
use super::compare::{compare_key_records, KeyOrdering};
use super::cursor::Frame;
use super::header::{self, btree_start_offset, PageHeader};
use super::{corrupt, payload, Error, PageSource, PageType, RowId};
use crate::freelist::Freelist;
use crate::pager::PageNum;
use crate::shadow::ShadowPageSource;

/// A page must keep at least this fraction of its usable bytes in cells;
/// dropping under it triggers a rebalance.
const MIN_FILL_DENOMINATOR: usize = 4;

pub struct Mutator<'a, 'p> {
    shadow: &'a mut ShadowPageSource<'p>,
    freelist: &'a mut Freelist,
}

impl<'a, 'p> Mutator<'a, 'p> {
    pub fn new(shadow: &'a mut ShadowPageSource<'p>, freelist: &'a mut Freelist) -> Mutator<'a, 'p> {
        Mutator { shadow, freelist }
    }

    fn usable(&self) -> u32 {
        self.shadow.page_size()
    }

    /// Allocate and initialize an empty leaf page: a new btree.
    pub fn create_tree(&mut self, table: bool) -> Result<PageNum, Error> {
        let pn = self.freelist.allocate(self.shadow)?;
        let usable = self.usable();
        let page_type = if table {
            PageType::TableLeaf
        } else {
            PageType::IndexLeaf
        };
        let page = self.shadow.page_mut(pn)?;
        page.fill(0);
        header::write_header(&PageHeader::empty(page_type, usable), page, pn);
        Ok(pn)
    }

    /// Release every page of a btree (cells' overflow chains included)
    /// onto the freelist, the root last.
    pub fn free_tree(&mut self, root: PageNum) -> Result<(), Error> {
        self.free_subtree(root)?;
        Ok(())
    }

    fn free_subtree(&mut self, pn: PageNum) -> Result<(), Error> {
        let (cells, hdr) = self.collect_cells(pn)?;
        for raw in &cells {
            let cell = cell::parse_cell(raw, hdr.page_type, self.usable(), pn)?;
            if let Some(first) = cell.overflow_page {
                payload::free_chain(
                    self.shadow,
                    self.freelist,
                    first,
                    cell.payload_size,
                    cell.inline_payload.len(),
                    pn,
                )?;
            }
            if let Some(child) = cell.left_child {
                self.free_subtree(child as PageNum)?;
            }
        }
        if let Some(rmp) = hdr.rightmost_pointer {
            self.free_subtree(rmp as PageNum)?;
        }
        self.freelist.push(self.shadow, pn)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Table btrees
    // ------------------------------------------------------------------

    /// Insert a new row.  The rowid must not already exist.
    pub fn table_insert(&mut self, root: PageNum, rowid: RowId, record: &[u8]) -> Result<(), Error> {
        let (frames, exact) = self.descend_rowid(root, rowid)?;
        if exact {
            return Err(Error::KeyExists);
        }
        let cell_bytes = self.build_leaf_cell(rowid, record)?;
        trace!("btree: insert rowid {} into page {}", rowid, frames.last().unwrap().page);
        self.insert_at(frames, cell_bytes)
    }

    /// Remove a row.  Frees its overflow chain and rebalances.
    pub fn table_delete(&mut self, root: PageNum, rowid: RowId) -> Result<(), Error> {
        let (frames, exact) = self.descend_rowid(root, rowid)?;
        if !exact {
            return Err(Error::KeyNotFound);
        }
        let leaf = *frames.last().unwrap();
        self.free_cell_overflow(leaf.page, leaf.idx)?;
        self.remove_cell(leaf.page, leaf.idx)?;
        self.rebalance(frames)
    }

    /// Replace a row's payload, in place when the new cell occupies exactly
    /// the old cell's footprint, by delete-and-reinsert otherwise.
    pub fn table_update(&mut self, root: PageNum, rowid: RowId, record: &[u8]) -> Result<(), Error> {
        let (frames, exact) = self.descend_rowid(root, rowid)?;
        if !exact {
            return Err(Error::KeyNotFound);
        }
        let leaf = *frames.last().unwrap();
        let (old_size, old_overflow, old_payload_size, old_inline_len) = {
            let page = self.shadow.page(leaf.page)?;
            let hdr = header::parse_header(&page, leaf.page)?;
            let ptr = header::cell_pointer(&page, &hdr, leaf.page, leaf.idx);
            let c = cell::parse_cell(&page[ptr..], hdr.page_type, self.usable(), leaf.page)?;
            (c.cell_size, c.overflow_page, c.payload_size, c.inline_payload.len())
        };
        let new_cell = self.build_leaf_cell(rowid, record)?;
        if new_cell.len() == old_size {
            if let Some(first) = old_overflow {
                payload::free_chain(
                    self.shadow,
                    self.freelist,
                    first,
                    old_payload_size,
                    old_inline_len,
                    leaf.page,
                )?;
            }
            let page = self.shadow.page_mut(leaf.page)?;
            let hdr = header::parse_header(page, leaf.page)?;
            let ptr = header::cell_pointer(page, &hdr, leaf.page, leaf.idx);
            page[ptr..ptr + new_cell.len()].copy_from_slice(&new_cell);
            return Ok(());
        }
        self.table_delete(root, rowid)?;
        self.table_insert(root, rowid, record)
    }

    /// The largest rowid in the tree, for rowid assignment.
    pub fn max_rowid(&mut self, root: PageNum) -> Result<Option<RowId>, Error> {
        let mut pn = root;
        loop {
            let page = self.shadow.page(pn)?;
            let hdr = header::parse_header(&page, pn)?;
            if hdr.page_type.is_leaf() {
                if hdr.num_cells == 0 {
                    return Ok(None);
                }
                let ptr = header::cell_pointer(&page, &hdr, pn, hdr.num_cells as usize - 1);
                let c = cell::parse_cell(&page[ptr..], hdr.page_type, self.usable(), pn)?;
                return Ok(c.rowid);
            }
            pn = hdr
                .rightmost_pointer
                .ok_or_else(|| corrupt(pn, "interior page without right child"))?
                as PageNum;
        }
    }

    fn build_leaf_cell(&mut self, rowid: RowId, record: &[u8]) -> Result<Vec<u8>, Error> {
        let inline = cell::table_leaf_inline_size(self.usable(), record.len());
        let overflow = if inline < record.len() {
            Some(payload::write_chain(
                self.shadow,
                self.freelist,
                &record[inline..],
            )?)
        } else {
            None
        };
        Ok(cell::build_table_leaf_cell(
            rowid,
            record.len(),
            &record[..inline],
            overflow,
        ))
    }

    /// Root-to-leaf path for a rowid; the leaf frame's idx is the
    /// cell (when `exact`) or the insertion slot.
    fn descend_rowid(&mut self, root: PageNum, target: RowId) -> Result<(Vec<Frame>, bool), Error> {
        let mut frames = Vec::new();
        let mut pn = root;
        loop {
            let page = self.shadow.page(pn)?;
            let hdr = header::parse_header(&page, pn)?;
            let mut lo = 0usize;
            let mut hi = hdr.num_cells as usize;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let ptr = header::cell_pointer(&page, &hdr, pn, mid);
                let c = cell::parse_cell(&page[ptr..], hdr.page_type, self.usable(), pn)?;
                let key = c.rowid.ok_or_else(|| corrupt(pn, "cell without rowid"))?;
                if key < target {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            frames.push(Frame { page: pn, idx: lo });
            if hdr.page_type.is_leaf() {
                let exact = if lo < hdr.num_cells as usize {
                    let ptr = header::cell_pointer(&page, &hdr, pn, lo);
                    let c = cell::parse_cell(&page[ptr..], hdr.page_type, self.usable(), pn)?;
                    c.rowid == Some(target)
                } else {
                    false
                };
                return Ok((frames, exact));
            }
            pn = child_of(&page, &hdr, pn, lo, self.usable())?;
        }
    }

    // ------------------------------------------------------------------
    // Index btrees
    // ------------------------------------------------------------------

    /// Insert an index entry (key columns + rowid suffix, record-encoded).
    /// With `unique_columns` set, an existing entry equal on the first
    /// `unique_columns` key columns fails with `KeyExists`.
    pub fn index_insert(
        &mut self,
        root: PageNum,
        entry: &[u8],
        ordering: &KeyOrdering,
        unique_columns: Option<usize>,
    ) -> Result<(), Error> {
        if let Some(prefix_len) = unique_columns {
            if self.index_prefix_exists(root, entry, ordering, prefix_len)? {
                return Err(Error::KeyExists);
            }
        }
        let (frames, exact) = self.descend_key(root, entry, ordering, true)?;
        if exact {
            return Err(Error::KeyExists);
        }
        let inline = cell::index_inline_size(self.usable(), entry.len());
        let overflow = if inline < entry.len() {
            Some(payload::write_chain(
                self.shadow,
                self.freelist,
                &entry[inline..],
            )?)
        } else {
            None
        };
        let cell_bytes = cell::build_index_leaf_cell(entry.len(), &entry[..inline], overflow);
        self.insert_at(frames, cell_bytes)
    }

    fn index_prefix_exists(
        &mut self,
        root: PageNum,
        entry: &[u8],
        ordering: &KeyOrdering,
        prefix_len: usize,
    ) -> Result<bool, Error> {
        let mut values = Vec::new();
        crate::record::decode_record(entry, &mut values)?;
        let prefix: Vec<crate::sql_value::ValueRef> =
            values.iter().take(prefix_len).copied().collect();
        let probe = crate::record::encode_record_refs(&prefix);
        let (frames, exact) = self.descend_key(root, &probe, ordering, false)?;
        let _ = frames;
        Ok(exact)
    }

    /// Delete the entry exactly matching `entry` (key + rowid).
    pub fn index_delete(
        &mut self,
        root: PageNum,
        entry: &[u8],
        ordering: &KeyOrdering,
    ) -> Result<(), Error> {
        let (frames, exact) = self.descend_key(root, entry, ordering, false)?;
        if !exact {
            return Err(Error::KeyNotFound);
        }
        let pos = *frames.last().unwrap();
        let pos_hdr = {
            let page = self.shadow.page(pos.page)?;
            header::parse_header(&page, pos.page)?
        };
        if pos_hdr.page_type.is_leaf() {
            self.free_cell_overflow(pos.page, pos.idx)?;
            self.remove_cell(pos.page, pos.idx)?;
            return self.rebalance(frames);
        }

        // The entry lives on an interior page.  Pull up its in-order
        // successor: save the successor's cell, delete it from its leaf
        // (keeping its overflow chain alive), then re-seek the target --
        // the rebalance may have moved it -- and splice the successor's
        // payload into its slot.
        let successor = self.leftmost_leaf_cell(pos.page, pos.idx + 1)?;
        let (succ_frames, succ_exact) =
            self.descend_key(root, &successor.full_key, ordering, false)?;
        if !succ_exact {
            return Err(corrupt(pos.page, "interior entry has no successor"));
        }
        let succ_pos = *succ_frames.last().unwrap();
        self.remove_cell(succ_pos.page, succ_pos.idx)?;
        self.rebalance(succ_frames)?;

        let (frames, exact) = self.descend_key(root, entry, ordering, false)?;
        if !exact {
            return Err(corrupt(root, "index entry vanished during delete"));
        }
        let pos = *frames.last().unwrap();
        let page_type = {
            let page = self.shadow.page(pos.page)?;
            header::parse_header(&page, pos.page)?.page_type
        };
        if page_type.is_leaf() {
            // The rebalance rotated the target down to a leaf: delete it
            // there, then put the removed successor back through the
            // normal insert path (its old overflow chain is rebuilt).
            self.free_cell_overflow(pos.page, pos.idx)?;
            self.remove_cell(pos.page, pos.idx)?;
            self.rebalance(frames)?;
            if let Some(first) = successor.overflow {
                payload::free_chain(
                    self.shadow,
                    self.freelist,
                    first,
                    successor.payload_size,
                    successor.inline.len(),
                    root,
                )?;
            }
            return self.index_insert(root, &successor.full_key, ordering, None);
        }
        let old_child = {
            let page = self.shadow.page(pos.page)?;
            let hdr = header::parse_header(&page, pos.page)?;
            let ptr = header::cell_pointer(&page, &hdr, pos.page, pos.idx);
            let c = cell::parse_cell(&page[ptr..], hdr.page_type, self.usable(), pos.page)?;
            c.left_child.ok_or_else(|| corrupt(pos.page, "interior cell without child"))?
        };
        self.free_cell_overflow(pos.page, pos.idx)?;
        self.remove_cell(pos.page, pos.idx)?;
        let replacement = cell::build_index_interior_cell(
            old_child,
            successor.payload_size,
            &successor.inline,
            successor.overflow,
        );
        self.insert_at(frames, replacement)
    }

    /// Copy of the leftmost leaf cell of the subtree at `parent`'s child
    /// slot `slot`, with its assembled key for re-seeking.
    fn leftmost_leaf_cell(&mut self, parent: PageNum, slot: usize) -> Result<SavedCell, Error> {
        let mut pn = {
            let page = self.shadow.page(parent)?;
            let hdr = header::parse_header(&page, parent)?;
            child_of(&page, &hdr, parent, slot, self.usable())?
        };
        loop {
            let page = self.shadow.page(pn)?;
            let hdr = header::parse_header(&page, pn)?;
            if hdr.page_type.is_leaf() {
                if hdr.num_cells == 0 {
                    return Err(corrupt(pn, "empty leaf inside a populated subtree"));
                }
                let ptr = header::cell_pointer(&page, &hdr, pn, 0);
                let c = cell::parse_cell(&page[ptr..], hdr.page_type, self.usable(), pn)?;
                let full_key = if c.overflow_page.is_some() {
                    payload::assemble(
                        self.shadow,
                        c.payload_size,
                        c.inline_payload,
                        c.overflow_page,
                        pn,
                    )?
                } else {
                    c.inline_payload.to_vec()
                };
                return Ok(SavedCell {
                    payload_size: c.payload_size,
                    inline: c.inline_payload.to_vec(),
                    overflow: c.overflow_page,
                    full_key,
                });
            }
            pn = child_of(&page, &hdr, pn, 0, self.usable())?;
        }
    }

    /// Root-to-position path for a key probe.  With `for_insert`, the leaf
    /// frame's idx is the insertion slot; otherwise the path stops wherever
    /// the first matching entry lives (leaf or interior).
    fn descend_key(
        &mut self,
        root: PageNum,
        probe: &[u8],
        ordering: &KeyOrdering,
        for_insert: bool,
    ) -> Result<(Vec<Frame>, bool), Error> {
        let mut frames = Vec::new();
        let mut pn = root;
        loop {
            let page = self.shadow.page(pn)?;
            let hdr = header::parse_header(&page, pn)?;
            let mut lo = 0usize;
            let mut hi = hdr.num_cells as usize;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let key = self.cell_key(&page, &hdr, pn, mid)?;
                if compare_key_records(&key, probe, ordering)? == std::cmp::Ordering::Less {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            frames.push(Frame { page: pn, idx: lo });
            if hdr.page_type.is_leaf() {
                let exact = if lo < hdr.num_cells as usize {
                    let key = self.cell_key(&page, &hdr, pn, lo)?;
                    compare_key_records(&key, probe, ordering)? == std::cmp::Ordering::Equal
                } else {
                    false
                };
                if exact || for_insert {
                    return Ok((frames, exact));
                }
                // Not on this leaf; the next entry in order is the lower
                // bound's interior cell, which may match.
                while let Some(top) = frames.last().copied() {
                    let top_hdr = {
                        let page = self.shadow.page(top.page)?;
                        header::parse_header(&page, top.page)?
                    };
                    if !top_hdr.page_type.is_leaf() && top.idx < top_hdr.num_cells as usize {
                        let page = self.shadow.page(top.page)?;
                        let key = self.cell_key(&page, &top_hdr, top.page, top.idx)?;
                        let eq = compare_key_records(&key, probe, ordering)?
                            == std::cmp::Ordering::Equal;
                        return Ok((frames, eq));
                    }
                    if frames.len() == 1 {
                        break;
                    }
                    frames.pop();
                }
                return Ok((frames, false));
            }
            pn = child_of(&page, &hdr, pn, lo, self.usable())?;
        }
    }

    fn cell_key(
        &self,
        page: &[u8],
        hdr: &PageHeader,
        pn: PageNum,
        idx: usize,
    ) -> Result<Vec<u8>, Error> {
        let ptr = header::cell_pointer(page, hdr, pn, idx);
        let c = cell::parse_cell(&page[ptr..], hdr.page_type, self.usable(), pn)?;
        if c.overflow_page.is_some() {
            payload::assemble(self.shadow, c.payload_size, c.inline_payload, c.overflow_page, pn)
        } else {
            Ok(c.inline_payload.to_vec())
        }
    }

    // ------------------------------------------------------------------
    // Page-level editing
    // ------------------------------------------------------------------

    /// Insert `cell_bytes` at the position the frame stack points to,
    /// splitting upward as needed.
    fn insert_at(&mut self, frames: Vec<Frame>, cell_bytes: Vec<u8>) -> Result<(), Error> {
        let leaf = *frames.last().unwrap();
        if self.try_insert_cell(leaf.page, leaf.idx, &cell_bytes)? {
            return Ok(());
        }
        self.split_insert(frames, cell_bytes)
    }

    /// Attempt to place a cell on a page; false when even defragmenting
    /// cannot make room.
    fn try_insert_cell(&mut self, pn: PageNum, idx: usize, cell_bytes: &[u8]) -> Result<bool, Error> {
        let needed = cell_bytes.len();
        let usable = self.usable() as usize;
        let hdr = {
            let page = self.shadow.page(pn)?;
            header::parse_header(&page, pn)?
        };
        let ptr_end = hdr.cell_pointer_array_end(pn);
        let gap = (hdr.cell_content_start as usize).saturating_sub(ptr_end);

        // Contiguous fit: cell below the content start, pointer at the end
        // of the array.
        if gap >= needed + 2 {
            let offset = hdr.cell_content_start as usize - needed;
            let page = self.shadow.page_mut(pn)?;
            page[offset..offset + needed].copy_from_slice(cell_bytes);
            let mut hdr = hdr;
            insert_pointer(page, &mut hdr, pn, idx, offset);
            hdr.cell_content_start = offset as u32;
            header::write_header(&hdr, page, pn);
            return Ok(true);
        }

        // A freeblock can hold the cell if the pointer array still has room
        // to grow by one slot.
        if gap >= 2 {
            if let Some((block_off, block_size, prev_off)) = self.find_freeblock(pn, needed)? {
                let page = self.shadow.page_mut(pn)?;
                let mut hdr = header::parse_header(page, pn)?;
                let remainder = block_size - needed;
                let cell_off = block_off + remainder;
                if remainder >= 4 {
                    BigEndian::write_u16(&mut page[block_off + 2..block_off + 4], remainder as u16);
                } else {
                    // Unlink the block; too-small leftovers become fragments.
                    let next = BigEndian::read_u16(&page[block_off..block_off + 2]);
                    match prev_off {
                        Some(prev) => BigEndian::write_u16(&mut page[prev..prev + 2], next),
                        None => hdr.freeblock_start = next,
                    }
                    hdr.fragmented_bytes = hdr.fragmented_bytes.saturating_add(remainder as u8);
                }
                page[cell_off..cell_off + needed].copy_from_slice(cell_bytes);
                insert_pointer(page, &mut hdr, pn, idx, cell_off);
                header::write_header(&hdr, page, pn);
                return Ok(true);
            }
        }

        // Enough in total but not in one piece: defragment and retry.
        if self.total_free(pn)? >= needed + 2 {
            self.defragment(pn)?;
            return self.try_insert_cell(pn, idx, cell_bytes);
        }
        Ok(false)
    }

    /// First freeblock of at least `needed` bytes:
    /// `(offset, size, previous block's offset)`.
    fn find_freeblock(
        &self,
        pn: PageNum,
        needed: usize,
    ) -> Result<Option<(usize, usize, Option<usize>)>, Error> {
        let page = self.shadow.page(pn)?;
        let hdr = header::parse_header(&page, pn)?;
        let mut prev: Option<usize> = None;
        let mut off = hdr.freeblock_start as usize;
        while off != 0 {
            if off + 4 > page.len() {
                return Err(corrupt(pn, "freeblock offset out of range"));
            }
            let next = BigEndian::read_u16(&page[off..off + 2]) as usize;
            let size = BigEndian::read_u16(&page[off + 2..off + 4]) as usize;
            if size >= needed {
                return Ok(Some((off, size, prev)));
            }
            prev = Some(off);
            off = next;
        }
        Ok(None)
    }

    fn total_free(&self, pn: PageNum) -> Result<usize, Error> {
        let page = self.shadow.page(pn)?;
        let hdr = header::parse_header(&page, pn)?;
        let ptr_end = hdr.cell_pointer_array_end(pn);
        let gap = (hdr.cell_content_start as usize).saturating_sub(ptr_end);
        let mut blocks = 0usize;
        let mut off = hdr.freeblock_start as usize;
        while off != 0 {
            if off + 4 > page.len() {
                return Err(corrupt(pn, "freeblock offset out of range"));
            }
            blocks += BigEndian::read_u16(&page[off + 2..off + 4]) as usize;
            off = BigEndian::read_u16(&page[off..off + 2]) as usize;
        }
        Ok(gap + blocks + hdr.fragmented_bytes as usize)
    }

    /// Remove the cell at `idx`, folding its bytes into the freeblock
    /// chain (or the content-area gap when it sits at the content start).
    fn remove_cell(&mut self, pn: PageNum, idx: usize) -> Result<(), Error> {
        let usable = self.usable();
        let page = self.shadow.page_mut(pn)?;
        let mut hdr = header::parse_header(page, pn)?;
        let ptr = header::cell_pointer(page, &hdr, pn, idx);
        let c = cell::parse_cell(&page[ptr..], hdr.page_type, usable, pn)?;
        let size = c.cell_size;

        // Close the pointer array over the removed slot.
        for i in idx..hdr.num_cells as usize - 1 {
            let v = header::cell_pointer(page, &hdr, pn, i + 1);
            header::set_cell_pointer(page, &hdr, pn, i, v);
        }
        hdr.num_cells -= 1;

        if ptr == hdr.cell_content_start as usize {
            hdr.cell_content_start = (ptr + size) as u32;
            // Absorb any freeblock now sitting at the content start.
            loop {
                let mut prev: Option<usize> = None;
                let mut off = hdr.freeblock_start as usize;
                let mut absorbed = false;
                while off != 0 {
                    let next = BigEndian::read_u16(&page[off..off + 2]) as usize;
                    let bsize = BigEndian::read_u16(&page[off + 2..off + 4]) as usize;
                    if off == hdr.cell_content_start as usize {
                        match prev {
                            Some(p) => BigEndian::write_u16(&mut page[p..p + 2], next as u16),
                            None => hdr.freeblock_start = next as u16,
                        }
                        hdr.cell_content_start = (off + bsize) as u32;
                        absorbed = true;
                        break;
                    }
                    prev = Some(off);
                    off = next;
                }
                if !absorbed {
                    break;
                }
            }
        } else {
            insert_freeblock(page, &mut hdr, pn, ptr, size)?;
        }
        header::write_header(&hdr, page, pn);
        Ok(())
    }

    fn free_cell_overflow(&mut self, pn: PageNum, idx: usize) -> Result<(), Error> {
        let (overflow, payload_size, inline_len) = {
            let page = self.shadow.page(pn)?;
            let hdr = header::parse_header(&page, pn)?;
            let ptr = header::cell_pointer(&page, &hdr, pn, idx);
            let c = cell::parse_cell(&page[ptr..], hdr.page_type, self.usable(), pn)?;
            (c.overflow_page, c.payload_size, c.inline_payload.len())
        };
        if let Some(first) = overflow {
            payload::free_chain(self.shadow, self.freelist, first, payload_size, inline_len, pn)?;
        }
        Ok(())
    }

    /// Rewrite the page with its cells packed tightly at the end.
    fn defragment(&mut self, pn: PageNum) -> Result<(), Error> {
        let (cells, hdr) = self.collect_cells(pn)?;
        self.write_page_from_cells(pn, hdr.page_type, &cells, hdr.rightmost_pointer)?;
        Ok(())
    }

    /// All raw cell bytes of a page, in pointer-array order.
    fn collect_cells(&self, pn: PageNum) -> Result<(Vec<Vec<u8>>, PageHeader), Error> {
        let page = self.shadow.page(pn)?;
        let hdr = header::parse_header(&page, pn)?;
        let mut cells = Vec::with_capacity(hdr.num_cells as usize);
        for i in 0..hdr.num_cells as usize {
            let ptr = header::cell_pointer(&page, &hdr, pn, i);
            if ptr >= page.len() {
                return Err(corrupt(pn, "cell pointer out of range"));
            }
            let c = cell::parse_cell(&page[ptr..], hdr.page_type, self.usable(), pn)?;
            cells.push(page[ptr..ptr + c.cell_size].to_vec());
        }
        Ok((cells, hdr))
    }

    /// Rebuild a page from an ordered cell list.  Fails with a corrupt
    /// error if the cells cannot fit; callers size their lists first.
    fn write_page_from_cells(
        &mut self,
        pn: PageNum,
        page_type: PageType,
        cells: &[Vec<u8>],
        rightmost: Option<u32>,
    ) -> Result<(), Error> {
        let usable = self.usable() as usize;
        let start = btree_start_offset(pn);
        let hdr_size = header::header_size(page_type);
        let ptr_end = start + hdr_size + 2 * cells.len();
        let total: usize = cells.iter().map(|c| c.len()).sum();
        if ptr_end + total > usable {
            return Err(corrupt(pn, "cells do not fit on the page"));
        }
        let page = self.shadow.page_mut(pn)?;
        page[start..].fill(0);
        let mut hdr = PageHeader {
            page_type,
            freeblock_start: 0,
            num_cells: cells.len() as u16,
            cell_content_start: usable as u32,
            fragmented_bytes: 0,
            rightmost_pointer: if page_type.is_leaf() { None } else { rightmost },
        };
        let mut offset = usable;
        for (i, cell_bytes) in cells.iter().enumerate() {
            offset -= cell_bytes.len();
            page[offset..offset + cell_bytes.len()].copy_from_slice(cell_bytes);
            header::set_cell_pointer(page, &hdr, pn, i, offset);
        }
        hdr.cell_content_start = offset as u32;
        header::write_header(&hdr, page, pn);
        Ok(())
    }

    fn cells_fit(&self, pn: PageNum, page_type: PageType, cells: &[Vec<u8>]) -> bool {
        let usable = self.usable() as usize;
        let start = btree_start_offset(pn);
        let used: usize =
            start + header::header_size(page_type) + cells.iter().map(|c| c.len() + 2).sum::<usize>();
        used <= usable
    }

    // ------------------------------------------------------------------
    // Splits
    // ------------------------------------------------------------------

    /// The page at the top of `frames` cannot hold `new_cell`: split it,
    /// pushing a divider into the parent (recursively).
    fn split_insert(&mut self, mut frames: Vec<Frame>, new_cell: Vec<u8>) -> Result<(), Error> {
        let target = frames.pop().unwrap();
        let (mut cells, hdr) = self.collect_cells(target.page)?;
        cells.insert(target.idx, new_cell);
        let page_type = hdr.page_type;
        trace!(
            "btree: splitting page {} ({} cells)",
            target.page,
            cells.len()
        );

        let split = self.choose_split(&cells, page_type, hdr.rightmost_pointer, target.page)?;

        if frames.is_empty() {
            // Splitting the root: the root page number must not change, so
            // both halves move to fresh pages and the root becomes an
            // interior node over them.
            let left_pn = self.freelist.allocate(self.shadow)?;
            let right_pn = self.freelist.allocate(self.shadow)?;
            self.write_page_from_cells(left_pn, page_type, &split.left, split.left_rightmost)?;
            self.write_page_from_cells(right_pn, page_type, &split.right, split.right_rightmost)?;
            let divider = divider_cell(&split, left_pn as u32, page_type, self.usable(), target.page)?;
            let root_type = page_type.interior_of_family();
            self.write_page_from_cells(
                target.page,
                root_type,
                &[divider],
                Some(right_pn as u32),
            )?;
            return Ok(());
        }

        // Non-root: the old page keeps the left half, a fresh page takes
        // the right half, and the parent slot that pointed here moves to
        // the right half.
        let right_pn = self.freelist.allocate(self.shadow)?;
        self.write_page_from_cells(target.page, page_type, &split.left, split.left_rightmost)?;
        self.write_page_from_cells(right_pn, page_type, &split.right, split.right_rightmost)?;

        let parent = *frames.last().unwrap();
        self.repoint_child(parent.page, parent.idx, right_pn as u32)?;
        let divider = divider_cell(&split, target.page as u32, page_type, self.usable(), target.page)?;
        if self.try_insert_cell(parent.page, parent.idx, &divider)? {
            return Ok(());
        }
        self.split_insert(frames, divider)
    }

    /// Point the parent's child slot `idx` at `new_child`.  Child pointers
    /// are fixed-width, so this never resizes a cell.
    fn repoint_child(&mut self, parent: PageNum, idx: usize, new_child: u32) -> Result<(), Error> {
        let page = self.shadow.page_mut(parent)?;
        let mut hdr = header::parse_header(page, parent)?;
        if idx == hdr.num_cells as usize {
            hdr.rightmost_pointer = Some(new_child);
            header::write_header(&hdr, page, parent);
        } else {
            let ptr = header::cell_pointer(page, &hdr, parent, idx);
            BigEndian::write_u32(&mut page[ptr..ptr + 4], new_child);
        }
        Ok(())
    }

    /// Divide an ordered cell list into halves of roughly equal bytes; for
    /// interior pages and index leaves the middle cell is promoted.
    fn choose_split(
        &self,
        cells: &[Vec<u8>],
        page_type: PageType,
        rightmost: Option<u32>,
        pn: PageNum,
    ) -> Result<Split, Error> {
        if cells.len() < 2 {
            return Err(corrupt(pn, "cannot split a page with a single cell"));
        }
        let total: usize = cells.iter().map(|c| c.len()).sum();
        let mut acc = 0usize;
        let mut split_at = cells.len() / 2;
        for (i, c) in cells.iter().enumerate() {
            acc += c.len();
            if acc * 2 >= total {
                split_at = i;
                break;
            }
        }

        match page_type {
            PageType::TableLeaf => {
                // B+-style: the divider copies the left half's max rowid
                // and every row stays on a leaf.
                let split_at = split_at.clamp(0, cells.len() - 2);
                let left = cells[..=split_at].to_vec();
                let right = cells[split_at + 1..].to_vec();
                let last_rowid = {
                    let last = cell::parse_cell(&left[left.len() - 1], page_type, self.usable(), pn)?;
                    last.rowid.ok_or_else(|| corrupt(pn, "leaf cell without rowid"))?
                };
                Ok(Split {
                    left,
                    right,
                    left_rightmost: None,
                    right_rightmost: None,
                    promoted: Promoted::Rowid(last_rowid),
                })
            }
            PageType::IndexLeaf => {
                // The middle entry moves up; it must not appear twice.
                if cells.len() < 3 {
                    return Err(corrupt(pn, "index leaf split needs three cells"));
                }
                let split_at = split_at.clamp(1, cells.len() - 2);
                let left = cells[..split_at].to_vec();
                let mid = cells[split_at].clone();
                let right = cells[split_at + 1..].to_vec();
                Ok(Split {
                    left,
                    right,
                    left_rightmost: None,
                    right_rightmost: None,
                    promoted: Promoted::Cell(mid),
                })
            }
            PageType::TableInterior | PageType::IndexInterior => {
                if cells.len() < 3 {
                    return Err(corrupt(pn, "interior split needs three cells"));
                }
                let split_at = split_at.clamp(1, cells.len() - 2);
                let left = cells[..split_at].to_vec();
                let mid = cells[split_at].clone();
                let right = cells[split_at + 1..].to_vec();
                let mid_cell = cell::parse_cell(&mid, page_type, self.usable(), pn)?;
                let left_rightmost = mid_cell.left_child;
                Ok(Split {
                    left,
                    right,
                    left_rightmost,
                    right_rightmost: rightmost,
                    promoted: Promoted::Cell(mid),
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Rebalancing
    // ------------------------------------------------------------------

    /// Walk the path bottom-up, merging or redistributing any page that
    /// fell under the minimum fill, and collapsing the root when it is an
    /// interior page with no dividers left.
    fn rebalance(&mut self, mut frames: Vec<Frame>) -> Result<(), Error> {
        let root = match frames.first() {
            Some(f) => f.page,
            None => return Ok(()),
        };
        loop {
            let Some(&current) = frames.last() else {
                return Ok(());
            };
            if frames.len() == 1 {
                return self.maybe_collapse_root(current.page);
            }
            let (fill, _) = self.page_fill(current.page)?;
            if fill * MIN_FILL_DENOMINATOR >= self.usable() as usize {
                return Ok(());
            }
            let parent = frames[frames.len() - 2];
            let parent_cells = {
                let page = self.shadow.page(parent.page)?;
                header::parse_header(&page, parent.page)?.num_cells as usize
            };
            if parent_cells == 0 {
                // No sibling to balance with; the parent will collapse when
                // the loop reaches it.
                frames.pop();
                continue;
            }
            // Normalize to an adjacent (left, right) pair whose divider is
            // parent cell `left_slot`.
            let left_slot = if parent.idx == 0 { 0 } else { parent.idx - 1 };
            trace!(
                "btree: rebalancing page {} under parent {} (slot {})",
                current.page,
                parent.page,
                left_slot
            );
            self.balance_pair(root, parent.page, left_slot)?;
            frames.pop();
        }
    }

    /// The sum of cell sizes on a page and its header.
    fn page_fill(&self, pn: PageNum) -> Result<(usize, PageHeader), Error> {
        let page = self.shadow.page(pn)?;
        let hdr = header::parse_header(&page, pn)?;
        let mut fill = 0usize;
        for i in 0..hdr.num_cells as usize {
            let ptr = header::cell_pointer(&page, &hdr, pn, i);
            let c = cell::parse_cell(&page[ptr..], hdr.page_type, self.usable(), pn)?;
            fill += c.cell_size;
        }
        Ok((fill, hdr))
    }

    /// Merge or redistribute the children at parent slots `left_slot` and
    /// `left_slot + 1`.
    fn balance_pair(&mut self, root: PageNum, parent_pn: PageNum, left_slot: usize) -> Result<(), Error> {
        let (parent_cells_raw, parent_hdr) = self.collect_cells(parent_pn)?;
        let divider_raw = parent_cells_raw[left_slot].clone();
        let divider =
            cell::parse_cell(&divider_raw, parent_hdr.page_type, self.usable(), parent_pn)?;
        let left_pn = divider
            .left_child
            .ok_or_else(|| corrupt(parent_pn, "divider without child"))? as PageNum;
        let right_pn = {
            let page = self.shadow.page(parent_pn)?;
            child_of(&page, &parent_hdr, parent_pn, left_slot + 1, self.usable())?
        };

        let (left_cells, left_hdr) = self.collect_cells(left_pn)?;
        let (right_cells, right_hdr) = self.collect_cells(right_pn)?;
        let child_type = left_hdr.page_type;
        if right_hdr.page_type != child_type {
            return Err(corrupt(parent_pn, "sibling page types differ"));
        }

        // Build the combined, ordered child-level cell list.
        let mut combined: Vec<Vec<u8>> = left_cells;
        match child_type {
            PageType::TableLeaf => {}
            PageType::IndexLeaf => {
                // The divider entry comes back down between the halves.
                combined.push(cell::build_index_leaf_cell(
                    divider.payload_size,
                    divider.inline_payload,
                    divider.overflow_page,
                ));
            }
            PageType::TableInterior | PageType::IndexInterior => {
                let left_rmp = left_hdr
                    .rightmost_pointer
                    .ok_or_else(|| corrupt(left_pn, "interior page without right child"))?;
                combined.push(match child_type {
                    PageType::TableInterior => cell::build_table_interior_cell(
                        left_rmp,
                        divider
                            .rowid
                            .ok_or_else(|| corrupt(parent_pn, "divider without rowid"))?,
                    ),
                    _ => cell::build_index_interior_cell(
                        left_rmp,
                        divider.payload_size,
                        divider.inline_payload,
                        divider.overflow_page,
                    ),
                });
            }
        }
        combined.extend(right_cells);
        let final_rightmost = right_hdr.rightmost_pointer;

        if self.cells_fit(right_pn, child_type, &combined) {
            // Merge into the right page (whose parent slot survives the
            // divider removal); the left page goes to the freelist.
            self.write_page_from_cells(right_pn, child_type, &combined, final_rightmost)?;
            self.remove_cell(parent_pn, left_slot)?;
            self.freelist.push(self.shadow, left_pn)?;
            return Ok(());
        }

        // Redistribute: split the combined list and promote a fresh
        // divider between the halves.
        let split = self.choose_split(&combined, child_type, final_rightmost, parent_pn)?;
        self.write_page_from_cells(left_pn, child_type, &split.left, split.left_rightmost)?;
        self.write_page_from_cells(right_pn, child_type, &split.right, split.right_rightmost)?;
        let new_divider =
            divider_cell(&split, left_pn as u32, child_type, self.usable(), parent_pn)?;
        self.remove_cell(parent_pn, left_slot)?;
        if self.try_insert_cell(parent_pn, left_slot, &new_divider)? {
            return Ok(());
        }
        // The parent cannot even hold the rebuilt divider: split it.  The
        // original frames are stale by now, so rebuild the path from the
        // root before propagating.
        let frames = self.path_to_page(root, parent_pn)?;
        self.split_insert_with_idx(frames, left_slot, new_divider)
    }

    /// Rebuild a root-to-page path by page number (used on the rare
    /// balance path where the original frames are stale).
    fn path_to_page(&mut self, root: PageNum, target: PageNum) -> Result<Vec<Frame>, Error> {
        fn walk(
            m: &Mutator,
            pn: PageNum,
            target: PageNum,
            path: &mut Vec<Frame>,
        ) -> Result<bool, Error> {
            if pn == target {
                return Ok(true);
            }
            let page = m.shadow.page(pn)?;
            let hdr = header::parse_header(&page, pn)?;
            if hdr.page_type.is_leaf() {
                return Ok(false);
            }
            for idx in 0..=hdr.num_cells as usize {
                let child = child_of(&page, &hdr, pn, idx, m.usable())?;
                path.push(Frame { page: pn, idx });
                if walk(m, child, target, path)? {
                    return Ok(true);
                }
                path.pop();
            }
            Ok(false)
        }

        let mut path = Vec::new();
        if !walk(self, root, target, &mut path)? {
            return Err(corrupt(target, "page is not reachable from the root"));
        }
        path.push(Frame { page: target, idx: 0 });
        Ok(path)
    }

    fn split_insert_with_idx(
        &mut self,
        mut frames: Vec<Frame>,
        idx: usize,
        cell_bytes: Vec<u8>,
    ) -> Result<(), Error> {
        if let Some(last) = frames.last_mut() {
            last.idx = idx;
        }
        self.split_insert(frames, cell_bytes)
    }

    /// An interior root whose last divider disappeared has a single child;
    /// the child's content moves into the root and the child is freed
    /// (height decreases).  Collapsing is skipped when the child's cells
    /// cannot fit beside page 1's file header.
    fn maybe_collapse_root(&mut self, root: PageNum) -> Result<(), Error> {
        loop {
            let hdr = {
                let page = self.shadow.page(root)?;
                header::parse_header(&page, root)?
            };
            if hdr.page_type.is_leaf() || hdr.num_cells != 0 {
                return Ok(());
            }
            let child_pn = hdr
                .rightmost_pointer
                .ok_or_else(|| corrupt(root, "interior page without right child"))?
                as PageNum;
            let (child_cells, child_hdr) = self.collect_cells(child_pn)?;
            if !self.cells_fit(root, child_hdr.page_type, &child_cells) {
                return Ok(());
            }
            trace!("btree: collapsing root {} into child {}", root, child_pn);
            self.write_page_from_cells(
                root,
                child_hdr.page_type,
                &child_cells,
                child_hdr.rightmost_pointer,
            )?;
            self.freelist.push(self.shadow, child_pn)?;
        }
    }
}

/// The saved image of an index cell being promoted during a delete.
struct SavedCell {
    payload_size: usize,
    inline: Vec<u8>,
    overflow: Option<u32>,
    full_key: Vec<u8>,
}

struct Split {
    left: Vec<Vec<u8>>,
    right: Vec<Vec<u8>>,
    left_rightmost: Option<u32>,
    right_rightmost: Option<u32>,
    promoted: Promoted,
}

enum Promoted {
    /// Table-leaf splits promote a copied rowid divider.
    Rowid(RowId),
    /// Index and interior splits move the middle cell up.
    Cell(Vec<u8>),
}

/// The parent cell announcing `left_child` for a finished split.
fn divider_cell(
    split: &Split,
    left_child: u32,
    child_type: PageType,
    usable: u32,
    pn: PageNum,
) -> Result<Vec<u8>, Error> {
    match (&split.promoted, child_type) {
        (Promoted::Rowid(rowid), _) => Ok(cell::build_table_interior_cell(left_child, *rowid)),
        (Promoted::Cell(raw), PageType::TableInterior) => {
            let c = cell::parse_cell(raw, PageType::TableInterior, usable, pn)?;
            Ok(cell::build_table_interior_cell(
                left_child,
                c.rowid.ok_or_else(|| corrupt(pn, "divider without rowid"))?,
            ))
        }
        (Promoted::Cell(raw), PageType::IndexLeaf) => {
            let c = cell::parse_cell(raw, PageType::IndexLeaf, usable, pn)?;
            Ok(cell::build_index_interior_cell(
                left_child,
                c.payload_size,
                c.inline_payload,
                c.overflow_page,
            ))
        }
        (Promoted::Cell(raw), PageType::IndexInterior) => {
            let c = cell::parse_cell(raw, PageType::IndexInterior, usable, pn)?;
            Ok(cell::build_index_interior_cell(
                left_child,
                c.payload_size,
                c.inline_payload,
                c.overflow_page,
            ))
        }
        (Promoted::Cell(_), PageType::TableLeaf) => unreachable!("table leaves promote rowids"),
    }
}

/// The child page at slot `idx` of an interior page.
fn child_of(
    page: &[u8],
    hdr: &PageHeader,
    pn: PageNum,
    idx: usize,
    usable: u32,
) -> Result<PageNum, Error> {
    if idx == hdr.num_cells as usize {
        Ok(hdr
            .rightmost_pointer
            .ok_or_else(|| corrupt(pn, "interior page without right child"))? as PageNum)
    } else {
        let ptr = header::cell_pointer(page, hdr, pn, idx);
        let c = cell::parse_cell(&page[ptr..], hdr.page_type, usable, pn)?;
        Ok(c.left_child
            .ok_or_else(|| corrupt(pn, "interior cell without child"))? as PageNum)
    }
}

/// Shift the pointer array right from `idx` and write a new entry.
/// The caller updates `num_cells` via the header it holds.
fn insert_pointer(page: &mut [u8], hdr: &mut PageHeader, pn: PageNum, idx: usize, offset: usize) {
    let old_count = hdr.num_cells as usize;
    hdr.num_cells += 1;
    for i in (idx..old_count).rev() {
        let v = header::cell_pointer(page, hdr, pn, i);
        header::set_cell_pointer(page, hdr, pn, i + 1, v);
    }
    header::set_cell_pointer(page, hdr, pn, idx, offset);
}

/// Insert a freeblock at `offset` into the sorted chain, coalescing with
/// adjacent neighbors.
fn insert_freeblock(
    page: &mut [u8],
    hdr: &mut PageHeader,
    pn: PageNum,
    offset: usize,
    size: usize,
) -> Result<(), Error> {
    let mut prev: Option<usize> = None;
    let mut next = hdr.freeblock_start as usize;
    while next != 0 && next < offset {
        if next + 4 > page.len() {
            return Err(corrupt(pn, "freeblock offset out of range"));
        }
        prev = Some(next);
        next = BigEndian::read_u16(&page[next..next + 2]) as usize;
    }

    let mut off = offset;
    let mut sz = size;
    // Coalesce with the following block.
    if next != 0 && off + sz == next {
        let next_next = BigEndian::read_u16(&page[next..next + 2]) as usize;
        let next_size = BigEndian::read_u16(&page[next + 2..next + 4]) as usize;
        sz += next_size;
        next = next_next;
    }
    // Coalesce with the preceding block.
    if let Some(p) = prev {
        let p_size = BigEndian::read_u16(&page[p + 2..p + 4]) as usize;
        if p + p_size == off {
            off = p;
            sz += p_size;
            prev = if p == hdr.freeblock_start as usize {
                None
            } else {
                // Re-find the block before `p`.
                let mut q = hdr.freeblock_start as usize;
                let mut qprev = None;
                while q != p {
                    qprev = Some(q);
                    q = BigEndian::read_u16(&page[q..q + 2]) as usize;
                }
                qprev
            };
        }
    }

    BigEndian::write_u16(&mut page[off..off + 2], next as u16);
    BigEndian::write_u16(&mut page[off + 2..off + 4], sz as u16);
    match prev {
        Some(p) => BigEndian::write_u16(&mut page[p..p + 2], off as u16),
        None => hdr.freeblock_start = off as u16,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::cursor::{Cursor, SeekResult};
    use crate::journal::{Journal, JournalMode};
    use crate::pager::Pager;
    use crate::record::{decode_record, encode_record};
    use crate::sql_value::SqlValue;

    fn scratch(page_size: u32) -> (tempfile::TempDir, Pager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mut.db");
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        f.set_len(page_size as u64).unwrap();
        (dir, Pager::from_file(f, page_size, 1, true, None, 64))
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

    fn row(rowid: i64) -> Vec<u8> {
        encode_record(&[
            SqlValue::Int(rowid),
            SqlValue::Text(format!("row number {rowid}")),
        ])
    }

    fn scan_rowids(shadow: &ShadowPageSource, root: PageNum) -> Vec<i64> {
        let mut cursor = Cursor::new(shadow, root);
        let mut out = Vec::new();
        cursor.first().unwrap();
        while cursor.is_valid() {
            out.push(cursor.rowid().unwrap());
            cursor.next().unwrap();
        }
        out
    }

    #[test]
    fn test_insert_and_scan_single_leaf() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(true).unwrap();
        for rowid in [5i64, 1, 3, 2, 4] {
            m.table_insert(root, rowid, &row(rowid)).unwrap();
        }
        assert_eq!(scan_rowids(&shadow, root), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_duplicate_rowid_rejected() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(true).unwrap();
        m.table_insert(root, 1, &row(1)).unwrap();
        assert!(matches!(
            m.table_insert(root, 1, &row(1)),
            Err(Error::KeyExists)
        ));
    }

    #[test]
    fn test_insert_many_splits_and_scans_in_order() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(true).unwrap();
        // Insert a shuffled-ish sequence large enough for a multi-level
        // tree on 512-byte pages.
        let n = 1000i64;
        for i in 0..n {
            let rowid = (i * striding_coprime(n)) % n;
            m.table_insert(root, rowid, &row(rowid)).unwrap();
        }
        let got = scan_rowids(&shadow, root);
        let want: Vec<i64> = (0..n).collect();
        assert_eq!(got, want);
        // The root must still be the same page.
        let hdr = {
            let page = PageSource::page(&shadow, root).unwrap();
            header::parse_header(&page, root).unwrap()
        };
        assert!(!hdr.page_type.is_leaf());
    }

    fn striding_coprime(_n: i64) -> i64 {
        // 1000 and 7 are coprime, so i*7 mod 1000 enumerates every rowid.
        7
    }

    #[test]
    fn test_seek_after_splits() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(true).unwrap();
        for rowid in 0..500i64 {
            m.table_insert(root, rowid * 2, &row(rowid * 2)).unwrap();
        }
        let mut cursor = Cursor::new(&shadow, root);
        assert_eq!(cursor.seek_rowid(404).unwrap(), SeekResult::Found);
        assert_eq!(cursor.rowid().unwrap(), 404);
        // Missing rowid positions on the next larger entry.
        assert_eq!(cursor.seek_rowid(405).unwrap(), SeekResult::NotFound);
        assert_eq!(cursor.rowid().unwrap(), 406);
    }

    #[test]
    fn test_overflow_payload_round_trip() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(true).unwrap();
        let blob: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let record = encode_record(&[SqlValue::Blob(blob.clone())]);
        m.table_insert(root, 1, &record).unwrap();

        let mut cursor = Cursor::new(&shadow, root);
        assert_eq!(cursor.seek_rowid(1).unwrap(), SeekResult::Found);
        let payload = cursor.payload().unwrap();
        assert_eq!(payload, &record[..]);
        let mut values = Vec::new();
        decode_record(payload, &mut values).unwrap();
        assert_eq!(values[0].to_owned(), SqlValue::Blob(blob));
    }

    #[test]
    fn test_delete_and_rebalance_down_to_empty() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(true).unwrap();
        let n = 600i64;
        for rowid in 0..n {
            m.table_insert(root, rowid, &row(rowid)).unwrap();
        }
        // Delete everything in an order that exercises merges on both
        // edges of the tree.
        for rowid in (0..n).step_by(2) {
            m.table_delete(root, rowid).unwrap();
        }
        for rowid in (1..n).step_by(2).collect::<Vec<_>>().into_iter().rev() {
            m.table_delete(root, rowid).unwrap();
        }
        assert_eq!(scan_rowids(&shadow, root), Vec::<i64>::new());
        // The tree collapsed back to an empty root leaf, not a freed page.
        let hdr = {
            let page = PageSource::page(&shadow, root).unwrap();
            header::parse_header(&page, root).unwrap()
        };
        assert!(hdr.page_type.is_leaf());
        assert_eq!(hdr.num_cells, 0);
        // Deleting a missing key reports not-found.
        assert!(matches!(m.table_delete(root, 5), Err(Error::KeyNotFound)));
    }

    #[test]
    fn test_deleted_pages_are_reused() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(true).unwrap();
        for rowid in 0..400i64 {
            m.table_insert(root, rowid, &row(rowid)).unwrap();
        }
        for rowid in 0..400i64 {
            m.table_delete(root, rowid).unwrap();
        }
        assert!(fl.count > 0);
        let pages_before = shadow.page_count();
        let mut m = Mutator::new(&mut shadow, &mut fl);
        for rowid in 0..400i64 {
            m.table_insert(root, rowid, &row(rowid)).unwrap();
        }
        // Reinsertion reuses freed pages instead of extending the file.
        assert_eq!(shadow.page_count(), pages_before);
    }

    #[test]
    fn test_update_in_place_and_resized() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(true).unwrap();
        m.table_insert(root, 1, &row(1)).unwrap();
        // Same payload length: in-place.
        let same_len = encode_record(&[SqlValue::Int(1), SqlValue::Text("row number X".into())]);
        m.table_update(root, 1, &same_len).unwrap();
        // Larger payload: delete + reinsert.
        let bigger = encode_record(&[SqlValue::Int(1), SqlValue::Text("x".repeat(200))]);
        m.table_update(root, 1, &bigger).unwrap();

        assert!(matches!(
            m.table_update(root, 99, &row(99)),
            Err(Error::KeyNotFound)
        ));

        let mut cursor = Cursor::new(&shadow, root);
        assert_eq!(cursor.seek_rowid(1).unwrap(), SeekResult::Found);
        assert_eq!(cursor.payload().unwrap(), &bigger[..]);
    }

    fn index_entry(age: i64, rowid: i64) -> Vec<u8> {
        encode_record(&[SqlValue::Int(age), SqlValue::Int(rowid)])
    }

    #[test]
    fn test_index_insert_scan_and_seek() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(false).unwrap();
        let ordering = KeyOrdering::ascending(1);
        let n = 1000i64;
        for i in 0..n {
            let rowid = (i * 7) % n;
            m.index_insert(root, &index_entry(rowid % 100, rowid), &ordering, None)
                .unwrap();
        }

        // Full scan yields entries in (key, rowid) order, interior entries
        // included.
        let mut cursor = Cursor::new(&shadow, root);
        cursor.first().unwrap();
        let mut seen = Vec::new();
        while cursor.is_valid() {
            let payload = cursor.payload().unwrap().to_vec();
            let mut values = Vec::new();
            decode_record(&payload, &mut values).unwrap();
            seen.push((
                *values[0].as_int().unwrap(),
                *values[1].as_int().unwrap(),
            ));
            cursor.next().unwrap();
        }
        assert_eq!(seen.len(), n as usize);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);

        // A key-only probe finds the first entry with that key.
        let probe = encode_record(&[SqlValue::Int(42)]);
        let mut cursor = Cursor::new(&shadow, root);
        assert_eq!(cursor.seek_key(&probe, &ordering).unwrap(), SeekResult::Found);
        let payload = cursor.payload().unwrap().to_vec();
        let mut values = Vec::new();
        decode_record(&payload, &mut values).unwrap();
        assert_eq!(*values[0].as_int().unwrap(), 42);
        assert_eq!(*values[1].as_int().unwrap(), 42); // smallest rowid with age 42
    }

    #[test]
    fn test_index_unique_violation() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(false).unwrap();
        let ordering = KeyOrdering::ascending(1);
        m.index_insert(root, &index_entry(10, 1), &ordering, Some(1))
            .unwrap();
        // Same key, different rowid: refused on a unique index.
        assert!(matches!(
            m.index_insert(root, &index_entry(10, 2), &ordering, Some(1)),
            Err(Error::KeyExists)
        ));
        // Different key is fine.
        m.index_insert(root, &index_entry(11, 2), &ordering, Some(1))
            .unwrap();
    }

    #[test]
    fn test_index_delete_everywhere() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(false).unwrap();
        let ordering = KeyOrdering::ascending(1);
        let n = 800i64;
        for rowid in 0..n {
            m.index_insert(root, &index_entry(rowid, rowid), &ordering, None)
                .unwrap();
        }
        // Delete every entry; this hits leaf deletes, interior-entry
        // promotion, and merges.
        for rowid in 0..n {
            m.index_delete(root, &index_entry(rowid, rowid), &ordering)
                .unwrap();
        }
        let mut cursor = Cursor::new(&shadow, root);
        cursor.first().unwrap();
        assert!(!cursor.is_valid());
    }

    #[test]
    fn test_free_tree_returns_all_pages() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(true).unwrap();
        for rowid in 0..300i64 {
            m.table_insert(root, rowid, &row(rowid)).unwrap();
        }
        // Add an overflowing row so chain pages are freed too.
        let record = encode_record(&[SqlValue::Blob(vec![9u8; 5000])]);
        m.table_insert(root, 1000, &record).unwrap();

        let allocated = shadow.page_count() - 1; // page 1 is not part of the tree
        m.free_tree(root).unwrap();
        assert_eq!(fl.count, allocated);
    }

    #[test]
    fn test_max_rowid() {
        let (_dir, pager) = scratch(512);
        let mut shadow = shadow(&pager);
        let mut fl = Freelist::new(0, 0);
        let mut m = Mutator::new(&mut shadow, &mut fl);
        let root = m.create_tree(true).unwrap();
        assert_eq!(m.max_rowid(root).unwrap(), None);
        for rowid in 0..300i64 {
            m.table_insert(root, rowid, &row(rowid)).unwrap();
        }
        assert_eq!(m.max_rowid(root).unwrap(), Some(299));
    }
}
