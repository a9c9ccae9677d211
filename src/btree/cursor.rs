//! cursor walks one btree with an explicit stack of (page, cell index)
//! frames from the root to the current position.
//!
//! Pages store no parent pointers; the stack built during descent is the
//! path, and the mutator reuses the same shape to propagate splits.  Table
//! btrees position only on leaf cells.  Index btrees position on interior
//! cells too, since index interior cells are real entries that an in-order
//! traversal must yield between their children.

use std::ops::Range;

use super::cell::{self, Cell};
use super::compare::{compare_key_records, KeyOrdering};
use super::header::{self, PageHeader};
use super::{corrupt, payload, Error, PageSource, RowId};
use crate::pager::{PageBytes, PageNum};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub page: PageNum,
    /// Cell index on the page.  For interior frames mid-descent this is the
    /// child slot taken (`num_cells` means the right-child pointer).
    pub idx: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Invalid,
    AtCell,
    AtEnd,
}

/// Where a seek landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    /// Positioned on an exactly matching entry.
    Found,
    /// No match; positioned on the smallest entry greater than the target,
    /// or at end.
    NotFound,
}

enum CurrentPayload<'s> {
    Inline(PageBytes<'s>, Range<usize>),
    Assembled(Vec<u8>),
}

pub struct Cursor<'s, S: PageSource> {
    source: &'s S,
    root: PageNum,
    stack: Vec<Frame>,
    state: State,
    current: Option<CurrentPayload<'s>>,
}

impl<'s, S: PageSource> Cursor<'s, S> {
    pub fn new(source: &'s S, root: PageNum) -> Cursor<'s, S> {
        Cursor {
            source,
            root,
            stack: Vec::new(),
            state: State::Invalid,
            current: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == State::AtCell
    }

    pub fn at_end(&self) -> bool {
        self.state == State::AtEnd
    }

    fn header_of(&self, pn: PageNum) -> Result<PageHeader, Error> {
        let page = self.source.page(pn)?;
        header::parse_header(&page, pn)
    }

    fn parse_cell_at<'b>(
        &self,
        page: &'b [u8],
        hdr: &PageHeader,
        pn: PageNum,
        idx: usize,
    ) -> Result<Cell<'b>, Error> {
        if idx >= hdr.num_cells as usize {
            return Err(corrupt(pn, "cell index out of range"));
        }
        let ptr = header::cell_pointer(page, hdr, pn, idx);
        if ptr < header::btree_start_offset(pn) + hdr.size() || ptr >= page.len() {
            return Err(corrupt(pn, "cell pointer out of range"));
        }
        cell::parse_cell(&page[ptr..], hdr.page_type, self.source.usable_size(), pn)
    }

    /// The child page at slot `idx` (`num_cells` selects the right child).
    fn child_at(
        &self,
        page: &[u8],
        hdr: &PageHeader,
        pn: PageNum,
        idx: usize,
    ) -> Result<PageNum, Error> {
        if idx == hdr.num_cells as usize {
            Ok(hdr
                .rightmost_pointer
                .ok_or_else(|| corrupt(pn, "interior page without right child"))?
                as PageNum)
        } else {
            let cell = self.parse_cell_at(page, hdr, pn, idx)?;
            Ok(cell
                .left_child
                .ok_or_else(|| corrupt(pn, "interior cell without child"))? as PageNum)
        }
    }

    fn set_position(&mut self, state: State) {
        self.state = state;
        self.current = None;
    }

    /// Descend to the leftmost cell of the subtree rooted at `pn`.
    fn descend_leftmost(&mut self, mut pn: PageNum) -> Result<(), Error> {
        loop {
            let page = self.source.page(pn)?;
            let hdr = header::parse_header(&page, pn)?;
            self.stack.push(Frame { page: pn, idx: 0 });
            if hdr.page_type.is_leaf() {
                if hdr.num_cells == 0 {
                    return self.ascend_next();
                }
                self.set_position(State::AtCell);
                return Ok(());
            }
            pn = self.child_at(&page, &hdr, pn, 0)?;
        }
    }

    /// Descend to the rightmost cell of the subtree rooted at `pn`.
    fn descend_rightmost(&mut self, mut pn: PageNum) -> Result<(), Error> {
        loop {
            let page = self.source.page(pn)?;
            let hdr = header::parse_header(&page, pn)?;
            if hdr.page_type.is_leaf() {
                if hdr.num_cells == 0 {
                    self.stack.push(Frame { page: pn, idx: 0 });
                    return self.ascend_prev();
                }
                self.stack.push(Frame {
                    page: pn,
                    idx: hdr.num_cells as usize - 1,
                });
                self.set_position(State::AtCell);
                return Ok(());
            }
            let idx = hdr.num_cells as usize;
            self.stack.push(Frame { page: pn, idx });
            pn = self.child_at(&page, &hdr, pn, idx)?;
        }
    }

    /// Finished a subtree; climb until something is next in order.
    fn ascend_next(&mut self) -> Result<(), Error> {
        loop {
            self.stack.pop();
            let Some(top) = self.stack.last().copied() else {
                self.set_position(State::AtEnd);
                return Ok(());
            };
            let hdr = self.header_of(top.page)?;
            if top.idx < hdr.num_cells as usize {
                if hdr.page_type.is_table() {
                    // Table interior cells are dividers; move to the next
                    // subtree.
                    let idx = top.idx + 1;
                    self.stack.last_mut().unwrap().idx = idx;
                    let page = self.source.page(top.page)?;
                    let child = self.child_at(&page, &hdr, top.page, idx)?;
                    return self.descend_leftmost(child);
                }
                // Index interior cells are entries; this one is next.
                self.set_position(State::AtCell);
                return Ok(());
            }
            // Right subtree finished; keep climbing.
        }
    }

    /// Walked backwards off a subtree; climb until something precedes it.
    fn ascend_prev(&mut self) -> Result<(), Error> {
        loop {
            self.stack.pop();
            let Some(top) = self.stack.last().copied() else {
                self.set_position(State::AtEnd);
                return Ok(());
            };
            let hdr = self.header_of(top.page)?;
            if top.idx > 0 {
                let idx = top.idx - 1;
                self.stack.last_mut().unwrap().idx = idx;
                if hdr.page_type.is_table() {
                    let page = self.source.page(top.page)?;
                    let child = self.child_at(&page, &hdr, top.page, idx)?;
                    return self.descend_rightmost(child);
                }
                // Index interior: entry idx-1 precedes subtree idx.
                self.set_position(State::AtCell);
                return Ok(());
            }
        }
    }

    /// Position on the smallest entry.
    pub fn first(&mut self) -> Result<(), Error> {
        self.stack.clear();
        self.set_position(State::Invalid);
        self.descend_leftmost(self.root)
    }

    /// Position on the largest entry.
    pub fn last(&mut self) -> Result<(), Error> {
        self.stack.clear();
        self.set_position(State::Invalid);
        self.descend_rightmost(self.root)
    }

    /// Advance in key order.
    pub fn next(&mut self) -> Result<(), Error> {
        match self.state {
            State::Invalid => return self.first(),
            State::AtEnd => return Ok(()),
            State::AtCell => {}
        }
        let top = *self.stack.last().expect("valid cursor has a frame");
        let hdr = self.header_of(top.page)?;
        if hdr.page_type.is_leaf() {
            if top.idx + 1 < hdr.num_cells as usize {
                self.stack.last_mut().unwrap().idx = top.idx + 1;
                self.set_position(State::AtCell);
                return Ok(());
            }
            return self.ascend_next();
        }
        // On an index interior entry: next is the leftmost of the child
        // to its right.
        let idx = top.idx + 1;
        self.stack.last_mut().unwrap().idx = idx;
        let page = self.source.page(top.page)?;
        let child = self.child_at(&page, &hdr, top.page, idx)?;
        self.descend_leftmost(child)
    }

    /// Step backwards in key order.
    pub fn prev(&mut self) -> Result<(), Error> {
        match self.state {
            State::Invalid => return self.last(),
            State::AtEnd => return Ok(()),
            State::AtCell => {}
        }
        let top = *self.stack.last().expect("valid cursor has a frame");
        let hdr = self.header_of(top.page)?;
        if hdr.page_type.is_leaf() {
            if top.idx > 0 {
                self.stack.last_mut().unwrap().idx = top.idx - 1;
                self.set_position(State::AtCell);
                return Ok(());
            }
            return self.ascend_prev();
        }
        // On an index interior entry: previous is the rightmost of its
        // left child's subtree.
        let page = self.source.page(top.page)?;
        let child = self.child_at(&page, &hdr, top.page, top.idx)?;
        self.descend_rightmost(child)
    }

    /// Point lookup on a table btree.  At each interior node, binary-search
    /// for the first divider with key >= target and descend its left child
    /// (or the right child when every divider is smaller).
    pub fn seek_rowid(&mut self, target: RowId) -> Result<SeekResult, Error> {
        self.stack.clear();
        self.set_position(State::Invalid);
        let mut pn = self.root;
        loop {
            let page = self.source.page(pn)?;
            let hdr = header::parse_header(&page, pn)?;
            if hdr.page_type.is_leaf() {
                let (idx, exact) = self.leaf_lower_bound_rowid(&page, &hdr, pn, target)?;
                self.stack.push(Frame { page: pn, idx });
                if exact {
                    self.set_position(State::AtCell);
                    return Ok(SeekResult::Found);
                }
                if idx < hdr.num_cells as usize {
                    self.set_position(State::AtCell);
                } else {
                    self.ascend_next()?;
                }
                return Ok(SeekResult::NotFound);
            }
            let mut lo = 0usize;
            let mut hi = hdr.num_cells as usize;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let cell = self.parse_cell_at(&page, &hdr, pn, mid)?;
                let key = cell.rowid.ok_or_else(|| corrupt(pn, "divider without rowid"))?;
                if key < target {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            self.stack.push(Frame { page: pn, idx: lo });
            pn = self.child_at(&page, &hdr, pn, lo)?;
        }
    }

    fn leaf_lower_bound_rowid(
        &self,
        page: &[u8],
        hdr: &PageHeader,
        pn: PageNum,
        target: RowId,
    ) -> Result<(usize, bool), Error> {
        let mut lo = 0usize;
        let mut hi = hdr.num_cells as usize;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let cell = self.parse_cell_at(page, hdr, pn, mid)?;
            let key = cell.rowid.ok_or_else(|| corrupt(pn, "leaf cell without rowid"))?;
            if key < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let exact = if lo < hdr.num_cells as usize {
            let cell = self.parse_cell_at(page, hdr, pn, lo)?;
            cell.rowid == Some(target)
        } else {
            false
        };
        Ok((lo, exact))
    }

    /// Key lookup on an index btree.  Positions on the first entry whose
    /// key is >= the probe; `Found` when that entry compares equal (a
    /// probe without the rowid suffix matches any rowid).
    pub fn seek_key(&mut self, probe: &[u8], ordering: &KeyOrdering) -> Result<SeekResult, Error> {
        self.stack.clear();
        self.set_position(State::Invalid);
        let mut pn = self.root;
        loop {
            let page = self.source.page(pn)?;
            let hdr = header::parse_header(&page, pn)?;
            let mut lo = 0usize;
            let mut hi = hdr.num_cells as usize;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let key = self.cell_key_bytes(&page, &hdr, pn, mid)?;
                if compare_key_records(&key, probe, ordering)? == std::cmp::Ordering::Less {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            if hdr.page_type.is_leaf() {
                self.stack.push(Frame { page: pn, idx: lo });
                if lo < hdr.num_cells as usize {
                    let key = self.cell_key_bytes(&page, &hdr, pn, lo)?;
                    self.set_position(State::AtCell);
                    if compare_key_records(&key, probe, ordering)? == std::cmp::Ordering::Equal {
                        return Ok(SeekResult::Found);
                    }
                    return Ok(SeekResult::NotFound);
                }
                // Past the leaf: the next entry in order (an interior
                // entry on the path) may still match the probe.
                self.ascend_next()?;
                if self.state == State::AtCell {
                    let key = self.payload()?.to_vec();
                    if compare_key_records(&key, probe, ordering)? == std::cmp::Ordering::Equal {
                        return Ok(SeekResult::Found);
                    }
                }
                return Ok(SeekResult::NotFound);
            }
            // Equal interior entries may have equal predecessors in their
            // left subtree, so the descent never stops at an interior cell.
            self.stack.push(Frame { page: pn, idx: lo });
            pn = self.child_at(&page, &hdr, pn, lo)?;
        }
    }

    /// A cell's full key record, assembling overflow when present.
    fn cell_key_bytes(
        &self,
        page: &[u8],
        hdr: &PageHeader,
        pn: PageNum,
        idx: usize,
    ) -> Result<Vec<u8>, Error> {
        let cell = self.parse_cell_at(page, hdr, pn, idx)?;
        if cell.overflow_page.is_some() {
            payload::assemble(
                self.source,
                cell.payload_size,
                cell.inline_payload,
                cell.overflow_page,
                pn,
            )
        } else {
            Ok(cell.inline_payload.to_vec())
        }
    }

    /// The rowid of the current table-leaf cell.
    pub fn rowid(&self) -> Result<RowId, Error> {
        let top = self.require_position()?;
        let page = self.source.page(top.page)?;
        let hdr = header::parse_header(&page, top.page)?;
        let cell = self.parse_cell_at(&page, &hdr, top.page, top.idx)?;
        cell.rowid
            .ok_or_else(|| corrupt(top.page, "cell has no rowid"))
    }

    fn require_position(&self) -> Result<Frame, Error> {
        if self.state != State::AtCell {
            return Err(corrupt(self.root, "cursor is not positioned on a cell"));
        }
        Ok(*self.stack.last().expect("valid cursor has a frame"))
    }

    /// The current cell's logical payload: inline bytes plus any overflow.
    pub fn payload(&mut self) -> Result<&[u8], Error> {
        let top = self.require_position()?;
        if self.current.is_none() {
            let page = self.source.page(top.page)?;
            let hdr = header::parse_header(&page, top.page)?;
            let cell = self.parse_cell_at(&page, &hdr, top.page, top.idx)?;
            if cell.overflow_page.is_some() {
                let assembled = payload::assemble(
                    self.source,
                    cell.payload_size,
                    cell.inline_payload,
                    cell.overflow_page,
                    top.page,
                )?;
                self.current = Some(CurrentPayload::Assembled(assembled));
            } else {
                let start = cell.inline_payload.as_ptr() as usize - page.as_ptr() as usize;
                let range = start..start + cell.inline_payload.len();
                self.current = Some(CurrentPayload::Inline(page, range));
            }
        }
        Ok(match self.current.as_ref().unwrap() {
            CurrentPayload::Inline(page, range) => &page[range.clone()],
            CurrentPayload::Assembled(buf) => buf,
        })
    }

}
