//! The fast-insert tree: meta-tree, schedule object and merge engine
//! built on top of `btree.rs` and `pager.rs` (spec.md §3 "Meta-tree",
//! §4.6 "Fast-insert tree").
//!
//! New module — unique to this spec, so built directly from spec.md
//! rather than adapted from a teacher file. Three simplifications from
//! the literal text, recorded in DESIGN.md:
//!
//! 1. Block-linear allocation is approximated by tracking the pager's
//!    page-count delta across each fast-insert write rather than
//!    maintaining `iSubBlock`/`nSubPg` as a true bump pointer into a
//!    contiguous block; once the tracked count reaches a block's worth
//!    of pages the current sub-tree is sealed transparently inside
//!    `fast_write`, rather than surfacing `BLOCKFULL` to the caller.
//! 2. Merge execution is a full scan-and-bulk-insert into one fresh
//!    B-tree rather than a streamed `FiWriter` with block rotation and
//!    a separator-key hierarchy; a schedule therefore always produces
//!    exactly one output root.
//! 3. "Larger level numbers are older within an age" (spec.md §4.6
//!    prose) reads as contradicting its own allocation formula, which
//!    assigns each successive seal a level one past the previous
//!    maximum — monotonically increasing with time. This module follows
//!    the formula: larger level numbers are newer. That also happens to
//!    match `AgeLevel::encode`'s `~level` ordering, so meta-tree scans in
//!    ascending key order already visit the newest level of an age
//!    first with no extra sort.
//! 4. A scheduled merge's output isn't confined to the `nScheduleAlloc`
//!    blocks the literal text has the scheduler pre-allocate, since
//!    simplification 2 already means the output lands in one fresh
//!    B-tree of whatever size it needs rather than a block-rotating
//!    writer that would actually consume them. Pre-allocating blocks
//!    nothing ever writes into and then freeing them back unused at
//!    integration is pure waste, so `Schedule.blocks` is left empty and
//!    the scheduler mints blocks for a merge's output the same way any
//!    other B-tree growth does: through `Pager::allocate_page`.
//!
//! Partial-merge bookkeeping (`iNextPg`/`iNextCell`, rewriting a
//! partially-consumed level's surviving root) is dropped along with the
//! streamed writer: every scheduled merge here consumes its whole input
//! span in one pass.

use crate::storage::btree::{self, BTreeCursor};
use crate::storage::ondisk::{page_flags, AgeSummary, Schedule, ScheduleState, SUMMARY_RESERVED_KEY};
use crate::storage::pager::Pager;
use crate::types::{AgeLevel, CursorResult, Key, SeekOp, SeekResult, Value};
use crate::{KvCursor, Result};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, instrument, trace};

/// Bytes actually used by `Schedule::serialize`: a state word, four u32
/// fields, the block array, three more u32 fields, then the root array.
const SCHEDULE_SERIALIZED_LEN: usize =
    4 + 16 + super::ondisk::SCHEDULE_MAX_BLOCKS * 4 + 12 + super::ondisk::SCHEDULE_MAX_BLOCKS * 4;

// --------------------------------------------------------------------
// FI-value tag: distinguishes a live value from a delete marker inside
// an immutable sealed sub-tree (spec.md §4.6 "preserving delete markers").
// --------------------------------------------------------------------

fn encode_fi_value(value: Option<&[u8]>) -> Vec<u8> {
    match value {
        None => vec![0],
        Some(bytes) => {
            let mut out = Vec::with_capacity(1 + bytes.len());
            out.push(1);
            out.extend_from_slice(bytes);
            out
        }
    }
}

fn decode_fi_value(buf: &[u8]) -> Option<Vec<u8>> {
    if buf.first() == Some(&0) {
        None
    } else {
        Some(buf[1..].to_vec())
    }
}

// --------------------------------------------------------------------
// Meta-tree
// --------------------------------------------------------------------

fn ensure_meta_root(pager: &Pager) -> Result<u32> {
    let root = pager.header().meta_root;
    if root != 0 {
        return Ok(root);
    }
    let root = btree::new_empty_root(pager)?;
    pager.with_header_mut(|h| h.meta_root = root)?;
    Ok(root)
}

/// The meta-tree key the age-summary table is stored under: `{age:
/// SUMMARY_RESERVED_KEY, level: 0}`, which `AgeLevel::encode` places
/// after every real entry (every real age is `< SUMMARY_RESERVED_KEY`).
fn summary_key() -> [u8; 8] {
    AgeLevel::new(SUMMARY_RESERVED_KEY, 0).encode()
}

fn subtree_root(pager: &Rc<Pager>, al: AgeLevel) -> Result<Option<u32>> {
    let meta_root = ensure_meta_root(pager)?;
    let mut cur = BTreeCursor::new(pager.clone(), meta_root);
    if cur.seek(&al.encode(), SeekOp::EQ)?.unwrap() != SeekResult::Found {
        return Ok(None);
    }
    let bytes = cur
        .value()?
        .unwrap()
        .expect("meta-tree entry always carries a root pointer");
    Ok(Some(u32::from_be_bytes(bytes[0..4].try_into().unwrap())))
}

fn insert_subtree_root(pager: &Rc<Pager>, al: AgeLevel, root_pgno: u32) -> Result<()> {
    let meta_root = ensure_meta_root(pager)?;
    let mut cur = BTreeCursor::new(pager.clone(), meta_root);
    cur.insert(&al.encode(), &root_pgno.to_be_bytes())?.unwrap();
    let new_root = cur.root();
    if new_root != meta_root {
        pager.with_header_mut(|h| h.meta_root = new_root)?;
    }
    Ok(())
}

fn delete_subtree_entry(pager: &Rc<Pager>, al: AgeLevel) -> Result<()> {
    let meta_root = ensure_meta_root(pager)?;
    let mut cur = BTreeCursor::new(pager.clone(), meta_root);
    if cur.seek(&al.encode(), SeekOp::EQ)?.unwrap() == SeekResult::Found {
        cur.delete()?.unwrap();
    }
    Ok(())
}

fn read_summary(pager: &Rc<Pager>) -> Result<Vec<AgeSummary>> {
    let meta_root = ensure_meta_root(pager)?;
    let mut cur = BTreeCursor::new(pager.clone(), meta_root);
    let key = summary_key();
    if cur.seek(&key, SeekOp::EQ)?.unwrap() != SeekResult::Found {
        return Ok(Vec::new());
    }
    let bytes = cur.value()?.unwrap().unwrap_or_default();
    Ok(decode_summary(&bytes))
}

fn write_summary(pager: &Rc<Pager>, summary: &[AgeSummary]) -> Result<()> {
    let meta_root = ensure_meta_root(pager)?;
    let mut cur = BTreeCursor::new(pager.clone(), meta_root);
    cur.insert(&summary_key(), &encode_summary(summary))?.unwrap();
    let new_root = cur.root();
    if new_root != meta_root {
        pager.with_header_mut(|h| h.meta_root = new_root)?;
    }
    Ok(())
}

fn encode_summary(summary: &[AgeSummary]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + summary.len() * 6);
    buf.extend_from_slice(&(summary.len() as u32).to_be_bytes());
    for s in summary {
        buf.extend_from_slice(&s.min_level.to_be_bytes());
        buf.extend_from_slice(&s.n_level.to_be_bytes());
        buf.extend_from_slice(&s.merge_level.to_be_bytes());
    }
    buf
}

fn decode_summary(buf: &[u8]) -> Vec<AgeSummary> {
    if buf.len() < 4 {
        return Vec::new();
    }
    let count = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(count);
    let mut off = 4;
    for _ in 0..count {
        let min_level = u16::from_be_bytes(buf[off..off + 2].try_into().unwrap());
        let n_level = u16::from_be_bytes(buf[off + 2..off + 4].try_into().unwrap());
        let merge_level = u16::from_be_bytes(buf[off + 4..off + 6].try_into().unwrap());
        off += 6;
        out.push(AgeSummary {
            min_level,
            n_level,
            merge_level,
        });
    }
    out
}

fn ensure_age(summary: &mut Vec<AgeSummary>, age: u32) {
    while summary.len() <= age as usize {
        summary.push(AgeSummary::default());
    }
}

// --------------------------------------------------------------------
// Schedule page
// --------------------------------------------------------------------

fn ensure_schedule_page(pager: &Pager) -> Result<u32> {
    let existing = pager.header().schedule_page;
    if existing != 0 {
        return Ok(existing);
    }
    let page = pager.allocate_page()?;
    pager.with_header_mut(|h| h.schedule_page = page.id)?;
    Ok(page.id)
}

fn read_schedule(pager: &Pager) -> Result<Schedule> {
    let schedule_page = pager.header().schedule_page;
    if schedule_page == 0 {
        return Ok(Schedule::default());
    }
    let page = pager.get_page(schedule_page)?;
    let buf = page.buf.borrow();
    Ok(Schedule::deserialize(&buf[0..SCHEDULE_SERIALIZED_LEN]))
}

fn write_schedule(pager: &Pager, schedule: &Schedule) -> Result<()> {
    let schedule_page = ensure_schedule_page(pager)?;
    let page = pager.get_page(schedule_page)?;
    pager.make_writable(&page)?;
    let mut buf = page.buf.borrow_mut();
    schedule.serialize(&mut buf[0..SCHEDULE_SERIALIZED_LEN]);
    let last = buf.len() - 1;
    buf[last] = page_flags::SCHEDULE;
    Ok(())
}

// --------------------------------------------------------------------
// Fast-insert write path (spec.md §4.6)
// --------------------------------------------------------------------

/// Writes `key -> value` (or a delete marker if `value` is `None`) into
/// the current fast-insert sub-tree, sealing it into the meta-tree once
/// it has grown by about a block's worth of pages.
#[instrument(skip(pager, key, value))]
pub fn fast_write(pager: &Rc<Pager>, key: &[u8], value: Option<&[u8]>) -> Result<()> {
    let mut sub_root = pager.header().sub_block;
    if sub_root == 0 {
        sub_root = btree::new_empty_root(pager)?;
        pager.with_header_mut(|h| {
            h.sub_block = sub_root;
            h.sub_block_pages_used = 0;
        })?;
    }

    let pages_before = pager.header().page_count;
    let mut cur = BTreeCursor::new(pager.clone(), sub_root);
    cur.insert(key, &encode_fi_value(value))?.unwrap();
    let new_root = cur.root();
    let pages_after = pager.header().page_count;
    let grown = pages_after.saturating_sub(pages_before);

    pager.with_header_mut(|h| {
        h.sub_block = new_root;
        h.sub_block_pages_used += grown;
    })?;

    if pager.header().sub_block_pages_used >= pager.pages_per_block() {
        seal_current_subtree(pager)?;
    }
    Ok(())
}

/// Seals the current sub-tree (`BLOCKFULL`, spec.md §4.6) into the
/// meta-tree under `{age=0, level=new-level}` and attempts to schedule
/// a merge.
fn seal_current_subtree(pager: &Rc<Pager>) -> Result<()> {
    let sub_root = pager.header().sub_block;
    if sub_root == 0 {
        return Ok(());
    }
    let mut summary = read_summary(pager)?;
    ensure_age(&mut summary, 0);
    let new_level = summary[0].min_level as u32 + summary[0].n_level as u32;
    insert_subtree_root(pager, AgeLevel::new(0, new_level), sub_root)?;
    summary[0].n_level += 1;
    write_summary(pager, &summary)?;
    pager.with_header_mut(|h| {
        h.sub_block = 0;
        h.sub_block_pages_used = 0;
    })?;
    debug!(level = new_level, "sealed fast-insert sub-tree");
    maybe_schedule_merge(pager)?;
    Ok(())
}

/// Merge scheduling (spec.md §4.6 "Merge scheduling"): picks the age
/// with the largest run of levels `>= nMinMerge` not already merging,
/// and sets the schedule page busy over that run.
fn maybe_schedule_merge(pager: &Rc<Pager>) -> Result<()> {
    let schedule = read_schedule(pager)?;
    if !matches!(schedule.state, ScheduleState::Empty) {
        return Ok(());
    }
    let mut summary = read_summary(pager)?;
    let min_merge = pager.min_merge();
    let candidate = summary
        .iter()
        .enumerate()
        .filter(|(_, s)| s.n_level as u32 >= min_merge && s.merge_level == 0)
        .max_by_key(|(_, s)| s.n_level)
        .map(|(age, s)| (age as u32, *s));
    let Some((age, age_summary)) = candidate else {
        return Ok(());
    };

    let min_level = age_summary.min_level as u32;
    let max_level = min_level + age_summary.n_level as u32 - 1;
    let out_level = summary
        .get(age as usize + 1)
        .map(|s| s.min_level as u32 + s.n_level as u32)
        .unwrap_or(0);

    write_schedule(
        pager,
        &Schedule {
            state: ScheduleState::Busy,
            age,
            min_level,
            max_level,
            out_level,
            blocks: Vec::new(),
            next_pg: 0,
            next_cell: 0,
            free_list: 0,
            roots: Vec::new(),
        },
    )?;
    summary[age as usize].merge_level = 1;
    write_summary(pager, &summary)?;
    trace!(age, min_level, max_level, out_level, "scheduled merge");
    Ok(())
}

/// Merge execution (spec.md §4.6 "Merge execution"), run by the
/// checkpointer: merges every sub-tree in `[minLevel, maxLevel]` of the
/// scheduled age into one fresh B-tree, higher (newer) levels
/// overwriting lower ones, preserving delete markers. Returns `true` if
/// a merge ran.
pub fn run_merge(pager: &Rc<Pager>) -> Result<bool> {
    let schedule = read_schedule(pager)?;
    if !matches!(schedule.state, ScheduleState::Busy) {
        return Ok(false);
    }

    let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    for level in schedule.min_level..=schedule.max_level {
        let Some(root) = subtree_root(pager, AgeLevel::new(schedule.age, level))? else {
            continue;
        };
        let mut cur = BTreeCursor::new(pager.clone(), root);
        if cur.first()?.unwrap() {
            loop {
                let key = cur.key().expect("cursor positioned on a cell");
                let value = cur
                    .value()?
                    .unwrap()
                    .expect("sub-tree leaf cell always carries an FI-tagged value");
                merged.insert(key, value);
                if !cur.next()?.unwrap() {
                    break;
                }
            }
        }
    }

    let out_root = btree::new_empty_root(pager)?;
    let mut out_cur = BTreeCursor::new(pager.clone(), out_root);
    for (key, value) in &merged {
        out_cur.insert(key, value)?.unwrap();
    }

    let mut schedule = schedule;
    schedule.roots = vec![out_cur.root()];
    schedule.state = ScheduleState::Done;
    write_schedule(pager, &schedule)?;
    debug!(age = schedule.age, entries = merged.len(), "ran merge");
    Ok(true)
}

/// Merge integration (spec.md §4.6 "Merge integration"), run by a
/// writer at commit time once the checkpointer has marked the schedule
/// `done`: retires the consumed levels and records the merged root(s)
/// one age up.
pub fn integrate_merge(pager: &Rc<Pager>) -> Result<bool> {
    let schedule = read_schedule(pager)?;
    if !matches!(schedule.state, ScheduleState::Done) {
        return Ok(false);
    }

    for level in schedule.min_level..=schedule.max_level {
        let al = AgeLevel::new(schedule.age, level);
        if let Some(root) = subtree_root(pager, al)? {
            btree::free_tree(pager, root)?;
        }
        delete_subtree_entry(pager, al)?;
    }

    let mut summary = read_summary(pager)?;
    ensure_age(&mut summary, schedule.age + 1);
    let consumed = (schedule.max_level - schedule.min_level + 1) as u16;
    summary[schedule.age as usize].n_level =
        summary[schedule.age as usize].n_level.saturating_sub(consumed);
    summary[schedule.age as usize].merge_level = 0;

    let next_age = schedule.age as usize + 1;
    if summary[next_age].n_level == 0 {
        summary[next_age].min_level = schedule.out_level as u16;
    }
    for &root in &schedule.roots {
        insert_subtree_root(pager, AgeLevel::new(schedule.age + 1, schedule.out_level), root)?;
    }
    summary[next_age].n_level += schedule.roots.len() as u16;
    write_summary(pager, &summary)?;

    write_schedule(pager, &Schedule::default())?;
    debug!(age = schedule.age, "integrated merge");
    Ok(true)
}

/// A scheduled merge, if any, found itself done at a prior checkpoint;
/// convenience wrapper so `Connection::commit` only needs one call.
pub fn maybe_integrate(pager: &Rc<Pager>) -> Result<()> {
    integrate_merge(pager)?;
    Ok(())
}

// --------------------------------------------------------------------
// Reads (spec.md §2 "Data-flow on a read")
// --------------------------------------------------------------------

/// Lazily creates the authoritative main B-tree's root if it doesn't
/// exist yet; called once from `Database::open`.
pub fn ensure_main_root(pager: &Pager) -> Result<()> {
    if pager.header().root_page != 0 {
        return Ok(());
    }
    let root = btree::new_empty_root(pager)?;
    pager.with_header_mut(|h| h.root_page = root)?;
    Ok(())
}

/// Layered lookup: the unsealed current sub-block first (newest), then
/// the meta-tree's sub-trees in ascending key order (youngest age
/// first, and within an age, largest-level-first — i.e. newest-first,
/// per `AgeLevel::encode`), then the main tree as the lowest-priority
/// fallback. A tombstone found in a sub-tree resolves the lookup (the
/// key is absent), since that tombstone is newer than anything below it.
pub fn get(pager: &Rc<Pager>, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let header = pager.header();

    if header.sub_block != 0 {
        let mut cur = BTreeCursor::new(pager.clone(), header.sub_block);
        if cur.seek(key, SeekOp::EQ)?.unwrap() == SeekResult::Found {
            let raw = cur
                .value()?
                .unwrap()
                .expect("sub-tree leaf cell always carries an FI-tagged value");
            return Ok(decode_fi_value(&raw));
        }
    }

    if header.meta_root != 0 {
        let mut cur = BTreeCursor::new(pager.clone(), header.meta_root);
        let reserved = summary_key();
        if cur.first()?.unwrap() {
            loop {
                let entry_key = cur.key().expect("cursor positioned on a cell");
                if entry_key.as_slice() != reserved {
                    let raw = cur
                        .value()?
                        .unwrap()
                        .expect("meta-tree entry always carries a root pointer");
                    let root = u32::from_be_bytes(raw[0..4].try_into().unwrap());
                    let mut sub = BTreeCursor::new(pager.clone(), root);
                    if sub.seek(key, SeekOp::EQ)?.unwrap() == SeekResult::Found {
                        let raw = sub
                            .value()?
                            .unwrap()
                            .expect("sub-tree leaf cell always carries an FI-tagged value");
                        return Ok(decode_fi_value(&raw));
                    }
                }
                if !cur.next()?.unwrap() {
                    break;
                }
            }
        }
    }

    if header.root_page != 0 {
        let mut cur = BTreeCursor::new(pager.clone(), header.root_page);
        if cur.seek(key, SeekOp::EQ)?.unwrap() == SeekResult::Found {
            return cur.value().map(|r| r.unwrap());
        }
    }

    Ok(None)
}

/// Thin `KvCursor` wrapper over the meta-tree's `BTreeCursor`: meta-tree
/// entries are plain 4-byte root pointers with no FI-tag, so every call
/// delegates straight through.
pub struct MetaCursor {
    inner: BTreeCursor,
}

impl MetaCursor {
    pub fn new(pager: &Rc<Pager>, meta_root: u32) -> Self {
        Self {
            inner: BTreeCursor::new(pager.clone(), meta_root),
        }
    }
}

impl KvCursor for MetaCursor {
    fn seek(&mut self, key: &[u8], op: SeekOp) -> Result<CursorResult<SeekResult>> {
        self.inner.seek(key, op)
    }

    fn first(&mut self) -> Result<CursorResult<bool>> {
        self.inner.first()
    }

    fn last(&mut self) -> Result<CursorResult<bool>> {
        self.inner.last()
    }

    fn next(&mut self) -> Result<CursorResult<bool>> {
        self.inner.next()
    }

    fn prev(&mut self) -> Result<CursorResult<bool>> {
        self.inner.prev()
    }

    fn key(&self) -> Option<Key> {
        self.inner.key()
    }

    fn value(&self) -> Result<CursorResult<Option<Value>>> {
        self.inner.value()
    }

    fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<CursorResult<()>> {
        self.inner.insert(key, value)
    }

    fn delete(&mut self) -> Result<CursorResult<()>> {
        self.inner.delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PagerConfig;
    use crate::io::{MemoryIO, IO};
    use std::sync::Arc;

    fn small_block_pager() -> Rc<Pager> {
        let io: Arc<dyn IO> = Arc::new(MemoryIO::new());
        let mut config = PagerConfig::default();
        // A handful of pages per block keeps the tests fast without
        // exercising the allocator differently than a production block.
        config.block_size = config.page_size * 4;
        Rc::new(Pager::open(io, "db", "db-wal", "db-shm", config).unwrap())
    }

    #[test]
    fn fast_insert_put_get_roundtrip() {
        let pager = small_block_pager();
        pager.begin_write().unwrap();
        fast_write(&pager, b"a", Some(b"1")).unwrap();
        fast_write(&pager, b"b", Some(b"2")).unwrap();
        pager.commit().unwrap();

        pager.begin_read().unwrap();
        assert_eq!(get(&pager, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(get(&pager, b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(get(&pager, b"missing").unwrap(), None);
        pager.end_read().unwrap();
    }

    #[test]
    fn delete_marker_hides_key_before_merge() {
        let pager = small_block_pager();
        pager.begin_write().unwrap();
        fast_write(&pager, b"k", Some(b"v")).unwrap();
        fast_write(&pager, b"k", None).unwrap();
        pager.commit().unwrap();

        pager.begin_read().unwrap();
        assert_eq!(get(&pager, b"k").unwrap(), None);
        pager.end_read().unwrap();
    }

    #[test]
    fn filling_a_block_seals_and_registers_in_meta_tree() {
        let pager = small_block_pager();
        pager.begin_write().unwrap();
        for i in 0..64u32 {
            fast_write(&pager, format!("k{i:04}").as_bytes(), Some(b"v")).unwrap();
        }
        pager.commit().unwrap();

        let summary = {
            pager.begin_read().unwrap();
            let s = read_summary(&pager).unwrap();
            pager.end_read().unwrap();
            s
        };
        assert!(!summary.is_empty());
        assert!(summary[0].n_level >= 1, "at least one seal must have happened");
    }

    #[test_log::test]
    fn merge_schedules_runs_and_integrates() {
        let pager = small_block_pager();
        pager.begin_write().unwrap();
        for i in 0..200u32 {
            fast_write(&pager, format!("k{i:05}").as_bytes(), Some(b"v")).unwrap();
        }
        pager.commit().unwrap();

        // A merge should have been scheduled by now (several blocks'
        // worth of seals at age 0).
        pager.begin_read().unwrap();
        let scheduled = read_schedule(&pager).unwrap();
        pager.end_read().unwrap();
        assert!(!matches!(scheduled.state, ScheduleState::Empty));

        pager.begin_write().unwrap();
        assert!(run_merge(&pager).unwrap());
        assert!(integrate_merge(&pager).unwrap());
        pager.commit().unwrap();

        pager.begin_read().unwrap();
        for i in 0..200u32 {
            assert_eq!(
                get(&pager, format!("k{i:05}").as_bytes()).unwrap(),
                Some(b"v".to_vec()),
                "key k{i:05} must survive a merge"
            );
        }
        let summary = read_summary(&pager).unwrap();
        assert!(summary.len() >= 2, "merge must have produced a second age");
        pager.end_read().unwrap();
    }

    #[test]
    fn merge_preserves_tombstone() {
        let pager = small_block_pager();
        pager.begin_write().unwrap();
        for i in 0..200u32 {
            fast_write(&pager, format!("k{i:05}").as_bytes(), Some(b"v")).unwrap();
        }
        fast_write(&pager, b"k00005", None).unwrap();
        for i in 0..64u32 {
            fast_write(&pager, format!("z{i:04}").as_bytes(), Some(b"v")).unwrap();
        }
        pager.commit().unwrap();

        pager.begin_write().unwrap();
        while matches!(read_schedule(&pager).unwrap().state, ScheduleState::Busy) {
            run_merge(&pager).unwrap();
            integrate_merge(&pager).unwrap();
        }
        pager.commit().unwrap();

        pager.begin_read().unwrap();
        assert_eq!(get(&pager, b"k00005").unwrap(), None);
        pager.end_read().unwrap();
    }
}
