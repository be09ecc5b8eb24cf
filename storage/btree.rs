//! The B-tree (spec.md §3 "B-tree cells", §4.5): page layout, cursors,
//! overflow chains, split-on-overflow balancing.
//!
//! New module — the teacher's own `btree.rs` was not in the retrieved
//! pack, so page/cell layout and cursor shape are built from spec.md
//! directly, in the idiom `storage::pager.rs` establishes for pages
//! (`Rc<Page>` with a `RefCell<Vec<u8>>` body, `pager.make_writable`
//! before any mutation).
//!
//! Two simplifications from the literal spec text, recorded in
//! DESIGN.md: (1) a page's cells are parsed into a `Vec<CellData>`,
//! mutated there, and the whole page body is re-packed on every write,
//! rather than maintained as an incrementally-updated free-space list —
//! the footer's `free_offset`/`free_space` still report the truth, so
//! fullness checks the balancer relies on stay accurate. (2) balancing
//! on overflow is a binary split of the sibling being written to (not
//! the full "collect up to 3 siblings, repack into 1..5 pages" sibling
//! window). Underflow after delete is handled only at the collapse
//! extreme — an emptied child is unlinked and freed, and an internal
//! node left pointing at nothing but its `right_child` copies that
//! child's page into its own slot in place (spec.md §4.5's mandatory
//! "root-underflow shrinks the tree by copying the single remaining
//! child into the root page", generalized here to every level since the
//! same in-place-copy trick works regardless of depth). A page that is
//! merely under the classic fill factor without emptying outright is not
//! rebalanced against a sibling; the spec's testable properties (§8)
//! constrain free-page accounting and merge behavior, not single-page
//! fill factor between sub-tree seals.

use crate::storage::ondisk::{
    self, page_flags, read_varint, write_varint, CellShape, PageFooter, MAX_DIRECT_OVERFLOW,
    MAX_INTERNAL_KEY_LEN,
};
use crate::storage::pager::{Page, PageRef, Pager};
use crate::types::{CursorResult, Key, SeekOp, SeekResult, Value};
use crate::{KvCursor, Result, StorageError};
use std::cmp::Ordering;
use std::rc::Rc;
use tracing::instrument;

/// Local value bytes kept inline are capped to a quarter page, matching
/// the rough budget spec.md §4.5 describes as `nLocalValue`.
fn local_value_budget(page_size: usize) -> usize {
    page_size / 4
}

/// Keys larger than half a page force the key itself to spill too
/// (shape (c)); otherwise only the value spills (shape (b)).
fn key_split_threshold(page_size: usize) -> usize {
    page_size / 2
}

#[derive(Clone, Debug)]
pub enum CellData {
    Leaf(LeafCell),
    Internal { key: Vec<u8>, child: u32 },
}

#[derive(Clone, Debug)]
pub struct LeafCell {
    pub key_total_len: u64,
    pub value_total_len: u64,
    pub local_key: Vec<u8>,
    pub local_value: Vec<u8>,
    /// Direct overflow pages (holds the key tail then the value, in that
    /// order, each page exactly `page_size` bytes except the last).
    pub overflow_pages: Vec<u32>,
    pub overflow_tree_root: u32,
    pub overflow_depth: u8,
}

impl CellData {
    fn key(&self) -> &[u8] {
        match self {
            CellData::Leaf(l) => &l.local_key,
            CellData::Internal { key, .. } => key,
        }
    }

    fn full_key(&self, pager: &Pager) -> Result<Vec<u8>> {
        match self {
            CellData::Internal { key, .. } => Ok(key.clone()),
            CellData::Leaf(l) => {
                if l.local_key.len() as u64 == l.key_total_len {
                    Ok(l.local_key.clone())
                } else {
                    let spilled = read_overflow(pager, l)?;
                    let key_tail_len = (l.key_total_len - l.local_key.len() as u64) as usize;
                    let mut full = l.local_key.clone();
                    full.extend_from_slice(&spilled[0..key_tail_len]);
                    Ok(full)
                }
            }
        }
    }

    fn child(&self) -> u32 {
        match self {
            CellData::Internal { child, .. } => *child,
            CellData::Leaf(_) => unreachable!("leaf cell has no child pointer"),
        }
    }
}

fn shape_of(l: &LeafCell) -> CellShape {
    if l.overflow_pages.is_empty() && l.overflow_depth == 0 {
        CellShape::Inline
    } else if l.local_key.len() as u64 == l.key_total_len {
        CellShape::ValueOverflow
    } else {
        CellShape::KeyAndValueOverflow
    }
}

fn encode_cell(cell: &CellData) -> Vec<u8> {
    let mut buf = Vec::new();
    match cell {
        CellData::Internal { key, child } => {
            write_varint(&mut buf, key.len() as u64);
            buf.extend_from_slice(key);
            buf.extend_from_slice(&child.to_be_bytes());
        }
        CellData::Leaf(l) => {
            let shape = shape_of(l);
            buf.push(match shape {
                CellShape::Inline => 0,
                CellShape::ValueOverflow => 1,
                CellShape::KeyAndValueOverflow => 2,
            });
            write_varint(&mut buf, l.key_total_len);
            write_varint(&mut buf, l.value_total_len);
            write_varint(&mut buf, l.local_key.len() as u64);
            write_varint(&mut buf, l.local_value.len() as u64);
            buf.extend_from_slice(&l.local_key);
            buf.extend_from_slice(&l.local_value);
            if shape != CellShape::Inline {
                let n_direct = l.overflow_pages.len() as u8;
                buf.push(ondisk::pack_overflow_control(n_direct, l.overflow_depth));
                for p in &l.overflow_pages {
                    buf.extend_from_slice(&p.to_be_bytes());
                }
                buf.extend_from_slice(&l.overflow_tree_root.to_be_bytes());
            }
        }
    }
    buf
}

fn decode_cell(buf: &[u8], is_leaf: bool) -> (CellData, usize) {
    if !is_leaf {
        let (nkey, n1) = read_varint(buf).expect("internal cell key length");
        let mut off = n1;
        let key = buf[off..off + nkey as usize].to_vec();
        off += nkey as usize;
        let child = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        return (CellData::Internal { key, child }, off);
    }
    let shape = match buf[0] {
        0 => CellShape::Inline,
        1 => CellShape::ValueOverflow,
        _ => CellShape::KeyAndValueOverflow,
    };
    let mut off = 1;
    let (key_total_len, n) = read_varint(&buf[off..]).unwrap();
    off += n;
    let (value_total_len, n) = read_varint(&buf[off..]).unwrap();
    off += n;
    let (local_key_len, n) = read_varint(&buf[off..]).unwrap();
    off += n;
    let (local_value_len, n) = read_varint(&buf[off..]).unwrap();
    off += n;
    let local_key = buf[off..off + local_key_len as usize].to_vec();
    off += local_key_len as usize;
    let local_value = buf[off..off + local_value_len as usize].to_vec();
    off += local_value_len as usize;
    let (overflow_pages, overflow_tree_root, overflow_depth) = if shape == CellShape::Inline {
        (Vec::new(), 0, 0)
    } else {
        let (n_direct, n_depth) = ondisk::unpack_overflow_control(buf[off]);
        off += 1;
        let mut pages = Vec::with_capacity(n_direct as usize);
        for _ in 0..n_direct {
            pages.push(u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()));
            off += 4;
        }
        let root = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        (pages, root, n_depth)
    };
    (
        CellData::Leaf(LeafCell {
            key_total_len,
            value_total_len,
            local_key,
            local_value,
            overflow_pages,
            overflow_tree_root,
            overflow_depth,
        }),
        off,
    )
}

struct PageView {
    flags: u8,
    right_child: u32,
    cells: Vec<CellData>,
}

impl PageView {
    fn is_leaf(&self) -> bool {
        self.flags & page_flags::LEAF != 0
    }

    fn empty_leaf() -> Self {
        Self {
            flags: page_flags::LEAF,
            right_child: 0,
            cells: Vec::new(),
        }
    }

    fn empty_internal() -> Self {
        Self {
            flags: page_flags::INTERNAL,
            right_child: 0,
            cells: Vec::new(),
        }
    }

    fn parse(buf: &[u8]) -> Self {
        let flags = buf[0];
        let is_leaf = flags & page_flags::LEAF != 0;
        let header_size = if is_leaf { 1 } else { 5 };
        let right_child = if is_leaf {
            0
        } else {
            u32::from_be_bytes(buf[1..5].try_into().unwrap())
        };
        let footer = PageFooter::read(buf);
        let mut cells = Vec::with_capacity(footer.cell_count as usize);
        let mut ptr_off = header_size;
        for _ in 0..footer.cell_count {
            let cell_off = u16::from_be_bytes(buf[ptr_off..ptr_off + 2].try_into().unwrap()) as usize;
            let (cell, _) = decode_cell(&buf[cell_off..], is_leaf);
            cells.push(cell);
            ptr_off += 2;
        }
        Self {
            flags,
            right_child,
            cells,
        }
    }

    /// Packs the page fresh from `cells`; returns `None` if it would not
    /// fit in `page_size` bytes (caller must split).
    fn try_serialize(&self, page_size: usize) -> Option<Vec<u8>> {
        let header_size = if self.is_leaf() { 1 } else { 5 };
        let encoded: Vec<Vec<u8>> = self.cells.iter().map(encode_cell).collect();
        let ptr_bytes = encoded.len() * 2;
        let content_bytes: usize = encoded.iter().map(|c| c.len()).sum();
        let needed = header_size + ptr_bytes + content_bytes + PAGE_FOOTER_RESERVED;
        if needed > page_size {
            return None;
        }
        let mut buf = vec![0u8; page_size];
        buf[0] = self.flags;
        if !self.is_leaf() {
            buf[1..5].copy_from_slice(&self.right_child.to_be_bytes());
        }
        let mut offset = header_size + ptr_bytes;
        let mut pointers = Vec::with_capacity(encoded.len());
        for cb in &encoded {
            pointers.push(offset as u16);
            buf[offset..offset + cb.len()].copy_from_slice(cb);
            offset += cb.len();
        }
        let mut p = header_size;
        for ptr in &pointers {
            buf[p..p + 2].copy_from_slice(&ptr.to_be_bytes());
            p += 2;
        }
        let footer = PageFooter {
            free_offset: offset as u16,
            free_space: (page_size - ondisk::PAGE_FOOTER_SIZE - offset) as u16,
            cell_count: self.cells.len() as u16,
        };
        footer.write(&mut buf);
        Some(buf)
    }
}

const PAGE_FOOTER_RESERVED: usize = ondisk::PAGE_FOOTER_SIZE;

fn write_page(pager: &Pager, page: &PageRef, view: &PageView) -> Result<()> {
    pager.make_writable(page)?;
    match view.try_serialize(pager.page_size() as usize) {
        Some(bytes) => {
            *page.buf.borrow_mut() = bytes;
            Ok(())
        }
        None => Err(StorageError::InternalError(
            "page overflow escaped split logic".into(),
        )),
    }
}

// --------------------------------------------------------------------
// Overflow chains (spec.md §3/§4.5 "Overflow assignment")
// --------------------------------------------------------------------

/// Splits `combined` (key tail ++ value, or just value) into content
/// pages: the first `MAX_DIRECT_OVERFLOW` stored directly, the rest
/// indexed by a pointer tree of fan-out `page_size/4`.
fn write_overflow(pager: &Pager, combined: &[u8]) -> Result<(Vec<u32>, u32, u8)> {
    let page_size = pager.page_size() as usize;
    let mut all_pages = Vec::new();
    for chunk in combined.chunks(page_size) {
        let page = pager.allocate_page()?;
        pager.make_writable(&page)?;
        let mut buf = vec![0u8; page_size];
        buf[0..chunk.len()].copy_from_slice(chunk);
        *page.buf.borrow_mut() = buf;
        all_pages.push(page.id);
    }
    if all_pages.len() <= MAX_DIRECT_OVERFLOW as usize {
        return Ok((all_pages, 0, 0));
    }
    let direct: Vec<u32> = all_pages[0..MAX_DIRECT_OVERFLOW as usize].to_vec();
    let rest = &all_pages[MAX_DIRECT_OVERFLOW as usize..];
    let (root, depth) = build_overflow_tree(pager, rest)?;
    Ok((direct, root, depth))
}

fn build_overflow_tree(pager: &Pager, pages: &[u32]) -> Result<(u32, u8)> {
    let fanout = (pager.page_size() as usize / 4).max(1);
    if pages.len() <= fanout {
        let root = write_index_page(pager, pages)?;
        return Ok((root, 1));
    }
    let mut child_roots = Vec::new();
    let mut depth = 0u8;
    for chunk in pages.chunks(fanout) {
        let (root, d) = build_overflow_tree(pager, chunk)?;
        depth = d;
        child_roots.push(root);
    }
    let root = write_index_page(pager, &child_roots)?;
    Ok((root, depth + 1))
}

fn write_index_page(pager: &Pager, pointers: &[u32]) -> Result<u32> {
    let page = pager.allocate_page()?;
    pager.make_writable(&page)?;
    let page_size = pager.page_size() as usize;
    let mut buf = vec![0u8; page_size];
    buf[0..4].copy_from_slice(&(pointers.len() as u32).to_be_bytes());
    let mut off = 4;
    for p in pointers {
        buf[off..off + 4].copy_from_slice(&p.to_be_bytes());
        off += 4;
    }
    *page.buf.borrow_mut() = buf;
    Ok(page.id)
}

fn read_index_page(pager: &Pager, page_no: u32) -> Result<Vec<u32>> {
    let page = pager.get_page(page_no)?;
    let buf = page.buf.borrow();
    let count = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(count);
    let mut off = 4;
    for _ in 0..count {
        out.push(u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()));
        off += 4;
    }
    Ok(out)
}

fn flatten_overflow_tree(pager: &Pager, root: u32, depth: u8) -> Result<Vec<u32>> {
    let entries = read_index_page(pager, root)?;
    if depth <= 1 {
        return Ok(entries);
    }
    let mut out = Vec::new();
    for child_root in entries {
        out.extend(flatten_overflow_tree(pager, child_root, depth - 1)?);
    }
    Ok(out)
}

fn read_overflow(pager: &Pager, cell: &LeafCell) -> Result<Vec<u8>> {
    let mut pages = cell.overflow_pages.clone();
    if cell.overflow_depth > 0 {
        pages.extend(flatten_overflow_tree(
            pager,
            cell.overflow_tree_root,
            cell.overflow_depth,
        )?);
    }
    let page_size = pager.page_size() as usize;
    let remainder_len =
        (cell.key_total_len - cell.local_key.len() as u64) + (cell.value_total_len - cell.local_value.len() as u64);
    let mut out = Vec::with_capacity(remainder_len as usize);
    for p in pages {
        let page = pager.get_page(p)?;
        out.extend_from_slice(&page.buf.borrow());
    }
    out.truncate(remainder_len as usize);
    Ok(out)
}

fn free_overflow_pages(pager: &Pager, cell: &LeafCell) -> Result<()> {
    for p in &cell.overflow_pages {
        pager.free_page(*p)?;
    }
    if cell.overflow_depth > 0 {
        free_overflow_tree(pager, cell.overflow_tree_root, cell.overflow_depth)?;
    }
    Ok(())
}

fn free_overflow_tree(pager: &Pager, root: u32, depth: u8) -> Result<()> {
    let entries = read_index_page(pager, root)?;
    if depth > 1 {
        for child in &entries {
            free_overflow_tree(pager, *child, depth - 1)?;
        }
    } else {
        for page in &entries {
            pager.free_page(*page)?;
        }
    }
    pager.free_page(root)
}

fn free_cell_overflow(pager: &Pager, cell: &CellData) -> Result<()> {
    if let CellData::Leaf(l) = cell {
        if shape_of(l) != CellShape::Inline {
            free_overflow_pages(pager, l)?;
        }
    }
    Ok(())
}

/// Builds a `LeafCell` for `(key, value)`, spilling to overflow pages as
/// needed per spec.md §4.5 "Overflow assignment".
fn make_leaf_cell(pager: &Pager, key: &[u8], value: &[u8]) -> Result<LeafCell> {
    let page_size = pager.page_size() as usize;
    let inline_budget = page_size.saturating_sub(16);
    if key.len() + value.len() <= inline_budget {
        return Ok(LeafCell {
            key_total_len: key.len() as u64,
            value_total_len: value.len() as u64,
            local_key: key.to_vec(),
            local_value: value.to_vec(),
            overflow_pages: Vec::new(),
            overflow_tree_root: 0,
            overflow_depth: 0,
        });
    }
    if key.len() <= key_split_threshold(page_size) {
        // shape (b): key inline, value partially spilled.
        let local_len = local_value_budget(page_size).min(value.len());
        let (local_value, spill) = value.split_at(local_len);
        let (overflow_pages, root, depth) = write_overflow(pager, spill)?;
        Ok(LeafCell {
            key_total_len: key.len() as u64,
            value_total_len: value.len() as u64,
            local_key: key.to_vec(),
            local_value: local_value.to_vec(),
            overflow_pages,
            overflow_tree_root: root,
            overflow_depth: depth,
        })
    } else {
        // shape (c): key also partially spilled; remainder = key tail ++ value.
        let local_key_len = local_value_budget(page_size).min(key.len());
        let (local_key, key_tail) = key.split_at(local_key_len);
        let mut combined = key_tail.to_vec();
        combined.extend_from_slice(value);
        let (overflow_pages, root, depth) = write_overflow(pager, &combined)?;
        Ok(LeafCell {
            key_total_len: key.len() as u64,
            value_total_len: value.len() as u64,
            local_key: local_key.to_vec(),
            local_value: Vec::new(),
            overflow_pages,
            overflow_tree_root: root,
            overflow_depth: depth,
        })
    }
}

fn leaf_value(pager: &Pager, l: &LeafCell) -> Result<Vec<u8>> {
    if l.value_total_len == l.local_value.len() as u64 {
        return Ok(l.local_value.clone());
    }
    let spilled = read_overflow(pager, l)?;
    let value_tail_start = spilled.len() - l.value_total_len as usize;
    Ok(spilled[value_tail_start..].to_vec())
}

// --------------------------------------------------------------------
// Search helpers
// --------------------------------------------------------------------

fn cmp_cell_key(cell: &CellData, target: &[u8], pager: &Pager) -> Result<Ordering> {
    Ok(cell.full_key(pager)?.as_slice().cmp(target))
}

/// Index of the first cell whose key is `>= target` (internal: `>`
/// routing per the `child <= key` convention this module uses).
fn lower_bound(pager: &Pager, cells: &[CellData], target: &[u8]) -> Result<usize> {
    let mut lo = 0usize;
    let mut hi = cells.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if cmp_cell_key(&cells[mid], target, pager)? == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Shortest prefix of `right` strictly greater than `left`, capped at
/// `MAX_INTERNAL_KEY_LEN` (spec.md §4.5 "Parent divider keys").
fn shortest_separator(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut i = 0;
    let max = left.len().min(right.len()).min(MAX_INTERNAL_KEY_LEN);
    while i < max && left[i] == right[i] {
        i += 1;
    }
    let len = (i + 1).min(right.len()).min(MAX_INTERNAL_KEY_LEN);
    right[0..len].to_vec()
}

// --------------------------------------------------------------------
// Insert / delete (recursive, page-at-a-time)
// --------------------------------------------------------------------

/// `Some((divider, new_right_page))` when the page at `page_no` split.
fn insert_rec(pager: &Pager, page_no: u32, cell: CellData) -> Result<Option<(Vec<u8>, u32)>> {
    let page = pager.get_page(page_no)?;
    let mut view = PageView::parse(&page.buf.borrow());
    let key = cell.key().to_vec();

    if view.is_leaf() {
        let idx = lower_bound(pager, &view.cells, &key)?;
        let exact = idx < view.cells.len() && cmp_cell_key(&view.cells[idx], &key, pager)? == Ordering::Equal;
        if exact {
            free_cell_overflow(pager, &view.cells[idx])?;
            view.cells[idx] = cell;
        } else {
            view.cells.insert(idx, cell);
        }
    } else {
        let idx = lower_bound(pager, &view.cells, &key)?;
        let child_no = if idx == view.cells.len() {
            view.right_child
        } else {
            view.cells[idx].child()
        };
        if let Some((divider, new_page)) = insert_rec(pager, child_no, cell)? {
            if idx == view.cells.len() {
                view.cells.push(CellData::Internal {
                    key: divider,
                    child: child_no,
                });
                view.right_child = new_page;
            } else {
                let existing_key = view.cells[idx].key().to_vec();
                view.cells[idx] = CellData::Internal {
                    key: existing_key,
                    child: new_page,
                };
                view.cells.insert(
                    idx,
                    CellData::Internal {
                        key: divider,
                        child: child_no,
                    },
                );
            }
        }
    }

    if view.try_serialize(pager.page_size() as usize).is_some() {
        write_page(pager, &page, &view)?;
        return Ok(None);
    }

    // Page overflowed: binary split, adjusting the split point until
    // both halves fit.
    let is_leaf = view.is_leaf();
    let mut mid = view.cells.len() / 2;
    loop {
        let (left_cells, right_cells, right_child_for_left) = if is_leaf {
            (
                view.cells[0..mid].to_vec(),
                view.cells[mid..].to_vec(),
                0,
            )
        } else {
            // promote cells[mid] as the divider; it is not duplicated.
            (
                view.cells[0..mid].to_vec(),
                view.cells[mid + 1..].to_vec(),
                view.cells[mid].child(),
            )
        };
        let left_view = PageView {
            flags: view.flags,
            right_child: if is_leaf { 0 } else { right_child_for_left },
            cells: left_cells,
        };
        let right_view = PageView {
            flags: view.flags,
            right_child: view.right_child,
            cells: right_cells,
        };
        let left_fits = left_view.try_serialize(pager.page_size() as usize);
        let right_fits = right_view.try_serialize(pager.page_size() as usize);
        if let (Some(lb), Some(rb)) = (left_fits, right_fits) {
            let divider = if is_leaf {
                let left_last = left_view.cells.last().unwrap().full_key(pager)?;
                let right_first = right_view.cells.first().unwrap().full_key(pager)?;
                shortest_separator(&left_last, &right_first)
            } else {
                view.cells[mid].key().to_vec()
            };
            pager.make_writable(&page)?;
            *page.buf.borrow_mut() = lb;
            let new_page = pager.allocate_page()?;
            pager.make_writable(&new_page)?;
            *new_page.buf.borrow_mut() = rb;
            return Ok(Some((divider, new_page.id)));
        }
        if mid <= 1 {
            return Err(StorageError::InternalError(
                "cell too large to fit on any page after split".into(),
            ));
        }
        mid -= 1;
    }
}

/// Deletes `key` from the sub-tree rooted at `page_no`. An emptied leaf
/// child is unlinked from its parent and freed; an internal node left
/// with no cells of its own (a pure pass-through to `right_child`)
/// collapses by copying that child's bytes into its own page, so the
/// page number the caller holds (the tree's root, for `BTreeCursor`)
/// keeps working after the level above it disappears.
fn delete_rec(pager: &Pager, page_no: u32, key: &[u8]) -> Result<bool> {
    let page = pager.get_page(page_no)?;
    let mut view = PageView::parse(&page.buf.borrow());

    if view.is_leaf() {
        let idx = lower_bound(pager, &view.cells, key)?;
        if idx >= view.cells.len() || cmp_cell_key(&view.cells[idx], key, pager)? != Ordering::Equal {
            return Ok(false);
        }
        free_cell_overflow(pager, &view.cells[idx])?;
        view.cells.remove(idx);
        write_page(pager, &page, &view)?;
        return Ok(true);
    }

    let idx = lower_bound(pager, &view.cells, key)?;
    let is_right = idx == view.cells.len();
    let child_no = if is_right {
        view.right_child
    } else {
        view.cells[idx].child()
    };
    if !delete_rec(pager, child_no, key)? {
        return Ok(false);
    }

    let child_page = pager.get_page(child_no)?;
    let child_emptied = {
        let child_view = PageView::parse(&child_page.buf.borrow());
        child_view.is_leaf() && child_view.cells.is_empty()
    };
    if child_emptied {
        if is_right {
            if let Some(promoted) = view.cells.pop() {
                view.right_child = promoted.child();
            }
        } else {
            view.cells.remove(idx);
        }
        pager.free_page(child_no)?;
    }

    if view.cells.is_empty() {
        let only_child_no = view.right_child;
        if only_child_no != page_no {
            let only_child_page = pager.get_page(only_child_no)?;
            let bytes = only_child_page.buf.borrow().clone();
            pager.make_writable(&page)?;
            *page.buf.borrow_mut() = bytes;
            pager.free_page(only_child_no)?;
        }
        return Ok(true);
    }

    write_page(pager, &page, &view)?;
    Ok(true)
}

// --------------------------------------------------------------------
// Cursor
// --------------------------------------------------------------------

pub struct BTreeCursor {
    pager: Rc<Pager>,
    root: std::cell::Cell<u32>,
    /// Path from root to the current leaf: `(page_no, index_of_child_or_cell)`.
    stack: Vec<(u32, usize)>,
    leaf: Option<(u32, usize)>,
}

impl BTreeCursor {
    pub fn new(pager: Rc<Pager>, root: u32) -> Self {
        Self {
            pager,
            root: std::cell::Cell::new(root),
            stack: Vec::new(),
            leaf: None,
        }
    }

    pub fn root(&self) -> u32 {
        self.root.get()
    }

    fn current_cell(&self) -> Result<Option<CellData>> {
        let Some((page_no, idx)) = self.leaf else {
            return Ok(None);
        };
        let page = self.pager.get_page(page_no)?;
        let view = PageView::parse(&page.buf.borrow());
        Ok(view.cells.get(idx).cloned())
    }

    /// Descends to the leftmost (`forward = true`) or rightmost leaf cell
    /// reachable from `page_no`, pushing the path onto `stack`.
    fn descend_edge(&mut self, mut page_no: u32, forward: bool) -> Result<bool> {
        self.stack.clear();
        loop {
            let page = self.pager.get_page(page_no)?;
            let view = PageView::parse(&page.buf.borrow());
            if view.is_leaf() {
                if view.cells.is_empty() {
                    self.leaf = None;
                    return Ok(false);
                }
                let idx = if forward { 0 } else { view.cells.len() - 1 };
                self.leaf = Some((page_no, idx));
                return Ok(true);
            }
            let idx = if forward { 0 } else { view.cells.len() };
            self.stack.push((page_no, idx));
            page_no = if idx == view.cells.len() {
                view.right_child
            } else {
                view.cells[idx].child()
            };
        }
    }

    fn step(&mut self, forward: bool) -> Result<bool> {
        let Some((page_no, idx)) = self.leaf else {
            return Ok(false);
        };
        let page = self.pager.get_page(page_no)?;
        let view = PageView::parse(&page.buf.borrow());
        let next_idx = if forward {
            idx.checked_add(1)
        } else {
            idx.checked_sub(1)
        };
        if let Some(next_idx) = next_idx {
            if next_idx < view.cells.len() {
                self.leaf = Some((page_no, next_idx));
                return Ok(true);
            }
        }
        // Walk up the stack to find a parent with a next sibling.
        while let Some((parent_no, parent_idx)) = self.stack.pop() {
            let parent_page = self.pager.get_page(parent_no)?;
            let parent_view = PageView::parse(&parent_page.buf.borrow());
            let max_idx = parent_view.cells.len();
            let sibling_idx = if forward {
                parent_idx.checked_add(1)
            } else {
                parent_idx.checked_sub(1)
            };
            if let Some(sibling_idx) = sibling_idx {
                let in_range = if forward {
                    sibling_idx <= max_idx
                } else {
                    sibling_idx <= max_idx
                };
                if in_range {
                    self.stack.push((parent_no, sibling_idx));
                    let child_no = if sibling_idx == max_idx {
                        parent_view.right_child
                    } else {
                        parent_view.cells[sibling_idx].child()
                    };
                    return self.descend_edge(child_no, forward);
                }
            }
        }
        self.leaf = None;
        Ok(false)
    }
}

impl KvCursor for BTreeCursor {
    #[instrument(skip(self, key))]
    fn seek(&mut self, key: &[u8], op: SeekOp) -> Result<CursorResult<SeekResult>> {
        self.stack.clear();
        let mut page_no = self.root.get();
        loop {
            let page = self.pager.get_page(page_no)?;
            let view = PageView::parse(&page.buf.borrow());
            if view.is_leaf() {
                let idx = lower_bound(&self.pager, &view.cells, key)?;
                let exact =
                    idx < view.cells.len() && cmp_cell_key(&view.cells[idx], key, &self.pager)? == Ordering::Equal;
                return match op {
                    SeekOp::EQ => {
                        if exact {
                            self.leaf = Some((page_no, idx));
                            Ok(CursorResult::Ok(SeekResult::Found))
                        } else {
                            self.leaf = None;
                            Ok(CursorResult::Ok(SeekResult::NotFound))
                        }
                    }
                    SeekOp::GE => {
                        if idx < view.cells.len() {
                            self.leaf = Some((page_no, idx));
                            Ok(CursorResult::Ok(if exact {
                                SeekResult::Found
                            } else {
                                SeekResult::NotFound
                            }))
                        } else {
                            let found = self.step_from_edge(true)?;
                            Ok(CursorResult::Ok(seek_result(found && exact)))
                        }
                    }
                    SeekOp::LE | SeekOp::LEFast => {
                        if exact {
                            self.leaf = Some((page_no, idx));
                            Ok(CursorResult::Ok(SeekResult::Found))
                        } else if idx > 0 {
                            self.leaf = Some((page_no, idx - 1));
                            Ok(CursorResult::Ok(SeekResult::NotFound))
                        } else {
                            self.leaf = None;
                            Ok(CursorResult::Ok(SeekResult::NotFound))
                        }
                    }
                };
            }
            let idx = lower_bound(&self.pager, &view.cells, key)?;
            self.stack.push((page_no, idx));
            page_no = if idx == view.cells.len() {
                view.right_child
            } else {
                view.cells[idx].child()
            };
        }
    }

    fn first(&mut self) -> Result<CursorResult<bool>> {
        Ok(CursorResult::Ok(self.descend_edge(self.root.get(), true)?))
    }

    fn last(&mut self) -> Result<CursorResult<bool>> {
        Ok(CursorResult::Ok(self.descend_edge(self.root.get(), false)?))
    }

    fn next(&mut self) -> Result<CursorResult<bool>> {
        Ok(CursorResult::Ok(self.step(true)?))
    }

    fn prev(&mut self) -> Result<CursorResult<bool>> {
        Ok(CursorResult::Ok(self.step(false)?))
    }

    fn key(&self) -> Option<Key> {
        self.current_cell().ok().flatten().and_then(|c| c.full_key(&self.pager).ok())
    }

    fn value(&self) -> Result<CursorResult<Option<Value>>> {
        match self.current_cell()? {
            None => Ok(CursorResult::Ok(None)),
            Some(CellData::Leaf(l)) => Ok(CursorResult::Ok(Some(leaf_value(&self.pager, &l)?))),
            Some(CellData::Internal { .. }) => unreachable!("cursor landed on an internal cell"),
        }
    }

    #[instrument(skip(self, key, value))]
    fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<CursorResult<()>> {
        let cell = make_leaf_cell(&self.pager, key, value)?;
        if let Some((divider, new_page)) = insert_rec(&self.pager, self.root.get(), CellData::Leaf(cell))? {
            let new_root = self.pager.allocate_page()?;
            self.pager.make_writable(&new_root)?;
            let view = PageView {
                flags: page_flags::INTERNAL,
                right_child: new_page,
                cells: vec![CellData::Internal {
                    key: divider,
                    child: self.root.get(),
                }],
            };
            write_page(&self.pager, &new_root, &view)?;
            self.root.set(new_root.id);
        }
        self.stack.clear();
        self.leaf = None;
        Ok(CursorResult::Ok(()))
    }

    fn delete(&mut self) -> Result<CursorResult<()>> {
        if let Some(key) = self.key() {
            delete_rec(&self.pager, self.root.get(), &key)?;
        }
        self.stack.clear();
        self.leaf = None;
        Ok(CursorResult::Ok(()))
    }
}

impl BTreeCursor {
    fn step_from_edge(&mut self, forward: bool) -> Result<bool> {
        self.step(forward)
    }
}

fn seek_result(found: bool) -> SeekResult {
    if found {
        SeekResult::Found
    } else {
        SeekResult::NotFound
    }
}

/// Creates a fresh, empty leaf page to serve as a new tree's root.
pub fn new_empty_root(pager: &Pager) -> Result<u32> {
    let page = pager.allocate_page()?;
    pager.make_writable(&page)?;
    write_page(pager, &page, &PageView::empty_leaf())?;
    Ok(page.id)
}

/// Recursively frees every page belonging to the tree rooted at
/// `root`, including overflow chains, used by the FI-tree merge
/// integration step to reclaim sub-trees once they are consumed.
pub fn free_tree(pager: &Pager, root: u32) -> Result<()> {
    let page = pager.get_page(root)?;
    let view = PageView::parse(&page.buf.borrow());
    for cell in &view.cells {
        free_cell_overflow(pager, cell)?;
        if let CellData::Internal { child, .. } = cell {
            free_tree(pager, *child)?;
        }
    }
    if !view.is_leaf() {
        free_tree(pager, view.right_child)?;
    }
    pager.free_page(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PagerConfig;
    use crate::io::{MemoryIO, IO};
    use rstest::rstest;
    use std::sync::Arc;

    fn new_pager() -> Rc<Pager> {
        let io: Arc<dyn IO> = Arc::new(MemoryIO::new());
        Rc::new(Pager::open(io, "db", "db-wal", "db-shm", PagerConfig::default()).unwrap())
    }

    #[test]
    fn insert_and_seek_roundtrip() {
        let pager = new_pager();
        pager.begin_write().unwrap();
        let root = new_empty_root(&pager).unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        cur.insert(b"b", b"2").unwrap();
        cur.insert(b"a", b"1").unwrap();
        cur.insert(b"c", b"3").unwrap();
        pager.commit().unwrap();

        pager.begin_read().unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), cur.root());
        let r = cur.seek(b"b", SeekOp::EQ).unwrap().unwrap();
        assert_eq!(r, SeekResult::Found);
        assert_eq!(cur.value().unwrap().unwrap(), Some(b"2".to_vec()));
        pager.end_read().unwrap();
    }

    #[test]
    fn ordered_forward_scan() {
        let pager = new_pager();
        pager.begin_write().unwrap();
        let root = new_empty_root(&pager).unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        for k in [3, 1, 4, 1, 5, 9, 2, 6] {
            cur.insert(format!("k{:02}", k).as_bytes(), b"v").unwrap();
        }
        let root = cur.root();
        pager.commit().unwrap();

        pager.begin_read().unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        let mut keys = Vec::new();
        if cur.first().unwrap().unwrap() {
            loop {
                keys.push(cur.key().unwrap());
                if !cur.next().unwrap().unwrap() {
                    break;
                }
            }
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        pager.end_read().unwrap();
    }

    #[test]
    fn delete_removes_key() {
        let pager = new_pager();
        pager.begin_write().unwrap();
        let root = new_empty_root(&pager).unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        cur.insert(b"a", b"1").unwrap();
        cur.insert(b"b", b"2").unwrap();
        cur.seek(b"a", SeekOp::EQ).unwrap().unwrap();
        cur.delete().unwrap();
        let root = cur.root();
        pager.commit().unwrap();

        pager.begin_read().unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        let r = cur.seek(b"a", SeekOp::EQ).unwrap().unwrap();
        assert_eq!(r, SeekResult::NotFound);
        pager.end_read().unwrap();
    }

    #[test]
    fn mass_delete_collapses_internal_levels_and_reclaims_pages() {
        let pager = new_pager();
        pager.begin_write().unwrap();
        let root = new_empty_root(&pager).unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        for i in 0..500u32 {
            cur.insert(format!("k{i:05}").as_bytes(), b"v").unwrap();
        }
        let root = cur.root();
        let page_count_after_insert = pager.header().page_count;
        pager.commit().unwrap();

        pager.begin_write().unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        for i in 0..499u32 {
            cur.seek(format!("k{i:05}").as_bytes(), SeekOp::EQ)
                .unwrap()
                .unwrap();
            cur.delete().unwrap();
        }
        pager.commit().unwrap();

        pager.begin_read().unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        for i in 0..499u32 {
            let r = cur
                .seek(format!("k{i:05}").as_bytes(), SeekOp::EQ)
                .unwrap()
                .unwrap();
            assert_eq!(r, SeekResult::NotFound, "k{i:05} must be gone");
        }
        let r = cur.seek(b"k00499", SeekOp::EQ).unwrap().unwrap();
        assert_eq!(r, SeekResult::Found, "the one surviving key must remain");
        pager.end_read().unwrap();

        // The internal pages vacated by the collapse must actually be
        // back on the free list, not merely unreachable.
        pager.begin_write().unwrap();
        let reused = pager.allocate_page().unwrap();
        assert!(
            reused.id <= page_count_after_insert,
            "a page freed by the collapse must be reused before growing the file"
        );
        pager.commit().unwrap();
    }

    #[test]
    fn large_value_spills_to_overflow_tree() {
        let pager = new_pager();
        pager.begin_write().unwrap();
        let root = new_empty_root(&pager).unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        let big_value = vec![0x5Au8; 6000];
        cur.insert(b"huge", &big_value).unwrap();
        let root = cur.root();
        pager.commit().unwrap();

        pager.begin_read().unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        cur.seek(b"huge", SeekOp::EQ).unwrap().unwrap();
        assert_eq!(cur.value().unwrap().unwrap(), Some(big_value));
        pager.end_read().unwrap();
    }

    #[test]
    fn cell_at_exact_page_budget_stays_inline() {
        let pager = new_pager();
        pager.begin_write().unwrap();
        let root = new_empty_root(&pager).unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        let page_size = pager.page_size() as usize;
        let value = vec![7u8; page_size - 32];
        cur.insert(b"k", &value).unwrap();
        pager.commit().unwrap();
    }

    #[test]
    fn key_over_200_bytes_gets_capped_separator() {
        let left = vec![b'a'; 250];
        let mut right = vec![b'a'; 250];
        right[249] = b'b';
        let sep = shortest_separator(&left, &right);
        assert!(sep.len() <= MAX_INTERNAL_KEY_LEN);
    }

    /// Table-driven seek-mode matrix (spec.md §4.5 `seek(cursor, key, mode)`)
    /// against a tree holding keys `b`, `d`, `f` — exercising the landing
    /// cell each mode picks for a hit, a miss between cells, and an
    /// out-of-range miss on either end.
    #[rstest]
    #[case::exact_hit(b"d", SeekOp::EQ, SeekResult::Found, Some(b"d".to_vec()))]
    #[case::exact_miss(b"c", SeekOp::EQ, SeekResult::NotFound, None)]
    #[case::le_on_hit(b"d", SeekOp::LE, SeekResult::Found, Some(b"d".to_vec()))]
    #[case::le_between(b"e", SeekOp::LE, SeekResult::NotFound, Some(b"d".to_vec()))]
    #[case::le_before_first(b"a", SeekOp::LE, SeekResult::NotFound, None)]
    #[case::ge_on_hit(b"d", SeekOp::GE, SeekResult::Found, Some(b"d".to_vec()))]
    #[case::ge_between(b"c", SeekOp::GE, SeekResult::NotFound, Some(b"d".to_vec()))]
    #[case::ge_after_last(b"z", SeekOp::GE, SeekResult::NotFound, None)]
    #[case::le_fast_between(b"e", SeekOp::LEFast, SeekResult::NotFound, Some(b"d".to_vec()))]
    fn seek_mode_matrix(
        #[case] target: &[u8],
        #[case] op: SeekOp,
        #[case] expect: SeekResult,
        #[case] landing_key: Option<Key>,
    ) {
        let pager = new_pager();
        pager.begin_write().unwrap();
        let root = new_empty_root(&pager).unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        cur.insert(b"d", b"d").unwrap();
        cur.insert(b"b", b"b").unwrap();
        cur.insert(b"f", b"f").unwrap();
        let root = cur.root();
        pager.commit().unwrap();

        pager.begin_read().unwrap();
        let mut cur = BTreeCursor::new(pager.clone(), root);
        let r = cur.seek(target, op).unwrap().unwrap();
        assert_eq!(r, expect);
        assert_eq!(cur.key(), landing_key);
        pager.end_read().unwrap();
    }
}
