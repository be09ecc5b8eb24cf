//! Write-ahead log (spec.md §4.3): frame append, page lookup under a
//! reader's snapshot, recovery, and checkpoint.
//!
//! Grounded on the `Wal`/`CheckpointResult`/`CheckpointMode` call shape the
//! teacher's `storage/pager.rs` makes against its own `storage/wal.rs`
//! (frame append on commit, `find_page` under a read lock, a checkpoint
//! step that drains frames into the database file) — the teacher's own
//! WAL module wasn't in the retrieved pack, so the frame format and
//! recovery/checkpoint algorithm below are rebuilt from spec.md directly.
//!
//! Three simplifications from the literal spec text, recorded in
//! DESIGN.md: (1) frames are addressed contiguously in one physical
//! region that is reset to the start of the file once a checkpoint has
//! no remaining reader to protect, rather than the three-region
//! (a)/(b)/(c) relocation scheme; a log that can't be fully reset is
//! defragmented in place once the reclaimable prefix exceeds
//! `BT_NWRAPLOG` frames, which is where that constant is spent. (2) the
//! page index used by `find_page` is rebuilt in memory on `open`/
//! `recover` by scanning the log, rather than kept as a persistent
//! shared-memory hash table (spec.md §4.3's `wal-index`) — when
//! `multi_proc` is set, every entry point that reads or extends the log
//! (`read_snapshot_window`, `begin_write`'s pre-write sync, `checkpoint`)
//! calls `sync_index` first to catch the index up to whatever a sibling
//! process has appended since this connection last looked, so a
//! single-process index cache never goes stale cross-process; it is
//! still rebuilt from the log itself rather than from a shared-memory
//! structure another process's index could be read out of directly. (3)
//! reader snapshot windows are the only thing actually written to the
//! shared-memory file, via ordinary `pread`/`pwrite` rather than
//! `File::shm_map`'s raw pointer, since nothing here needs true
//! cross-process memory sharing to be correct.

use crate::config::SyncMode;
use crate::io::{Buffer, Completion, File, IO};
use crate::lock_manager::{N_READERS, READER_BASE};
use crate::storage::database::DatabaseStorage;
use crate::storage::ondisk::{WalFrameHeader, WAL_FRAME_HEADER_SIZE};
use crate::{Result, StorageError};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{instrument, trace};

/// A reader's claimed snapshot window: it may see frames in
/// `first..=last` and must not have them reclaimed out from under it
/// (spec.md §4.2 "reader slots").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReaderSlotView {
    pub first: u32,
    pub last: u32,
}

impl ReaderSlotView {
    fn is_active(&self) -> bool {
        self.last > 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckpointResult {
    pub frames_checkpointed: u32,
    pub max_frame: u32,
}

struct FrameMeta {
    frame_no: u32,
    pgno: u32,
    offset: u64,
}

fn frame_size(page_size: u32) -> u64 {
    WAL_FRAME_HEADER_SIZE as u64 + page_size as u64
}

fn pread_exact(io: &Arc<dyn IO>, file: &Arc<dyn File>, pos: u64, len: usize) -> Result<Vec<u8>> {
    let out = Arc::new(RefCell::new(Buffer::allocate(len, std::rc::Rc::new(|_| {}))));
    let target = out.clone();
    let c = Arc::new(Completion::Read(crate::io::ReadCompletion::new(
        out,
        Box::new(|_| {}),
    )));
    file.pread(pos, c.clone())?;
    io.wait_for_completion(c)?;
    Ok(target.borrow().as_slice().to_vec())
}

fn pwrite_all(io: &Arc<dyn IO>, file: &Arc<dyn File>, pos: u64, bytes: &[u8]) -> Result<()> {
    let mut buf = Buffer::allocate(bytes.len(), std::rc::Rc::new(|_| {}));
    buf.as_mut_slice().copy_from_slice(bytes);
    let wrapped = Arc::new(RefCell::new(buf));
    let c = Arc::new(Completion::Write(crate::io::WriteCompletion::new(Box::new(
        |_| {},
    ))));
    file.pwrite(pos, wrapped, c.clone())?;
    io.wait_for_completion(c)
}

fn file_sync(io: &Arc<dyn IO>, file: &Arc<dyn File>) -> Result<()> {
    let c = Arc::new(Completion::Sync(crate::io::SyncCompletion::new(Box::new(
        |_| {},
    ))));
    file.sync(c.clone())?;
    io.wait_for_completion(c)
}

pub struct Wal {
    io: Arc<dyn IO>,
    file: Arc<dyn File>,
    shm: Arc<dyn File>,
    page_size: u32,
    /// Whether this database file may have other OS processes writing to
    /// it concurrently, each with their own in-memory copy of this index.
    multi_proc: Cell<bool>,
    next_frame_no: Cell<u32>,
    base_frame_no: Cell<u32>,
    frames: RefCell<Vec<FrameMeta>>,
    page_index: RefCell<HashMap<u32, Vec<u32>>>,
    seed: Cell<[u32; 2]>,
}

impl Wal {
    pub fn open(
        io: Arc<dyn IO>,
        file: Arc<dyn File>,
        shm: Arc<dyn File>,
        page_size: u32,
        multi_proc: bool,
    ) -> Result<Self> {
        let wal = Self {
            io,
            file,
            shm,
            page_size,
            multi_proc: Cell::new(multi_proc),
            next_frame_no: Cell::new(1),
            base_frame_no: Cell::new(1),
            frames: RefCell::new(Vec::new()),
            page_index: RefCell::new(HashMap::new()),
            seed: Cell::new([0, 0]),
        };
        wal.recover()?;
        Ok(wal)
    }

    /// Rebuilds the in-memory frame index by scanning the log from byte 0,
    /// stopping at the first short/corrupt frame, which (per spec.md
    /// §4.3 "Recovery") marks the point a prior writer crashed mid-append.
    #[instrument(skip(self))]
    pub fn recover(&self) -> Result<()> {
        let size = self.file.size()?;
        let fsize = frame_size(self.page_size);
        let mut frames = Vec::new();
        let mut index: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut seed = [0u32, 0u32];
        let mut frame_no = 1u32;
        let mut last_commit_end: u64 = 0;
        let mut offset = 0u64;
        while offset + fsize <= size {
            let raw = pread_exact(&self.io, &self.file, offset, fsize as usize)?;
            let header_bytes = &raw[0..WAL_FRAME_HEADER_SIZE];
            let body = &raw[WAL_FRAME_HEADER_SIZE..];
            let header = WalFrameHeader::deserialize(header_bytes);
            let header_sans_cksum = &header_bytes[0..12];
            let expected = WalFrameHeader::chain_checksum(seed, header_sans_cksum, body);
            if expected != header.cksum || header.pgno == 0 {
                break; // torn or never-written frame; stop here
            }
            seed = expected;
            frames.push(FrameMeta {
                frame_no,
                pgno: header.pgno,
                offset,
            });
            index.entry(header.pgno).or_default().push(frame_no);
            offset += fsize;
            if header.is_commit() {
                last_commit_end = offset;
            }
            frame_no += 1;
        }
        // Discard any frames past the last commit: an uncommitted tail
        // left by a crashed writer must not become visible.
        while let Some(last) = frames.last() {
            if last.offset >= last_commit_end {
                let removed = frames.pop().unwrap();
                if let Some(v) = index.get_mut(&removed.pgno) {
                    v.retain(|&f| f != removed.frame_no);
                }
            } else {
                break;
            }
        }
        let next = frames.last().map(|f| f.frame_no + 1).unwrap_or(1);
        *self.frames.borrow_mut() = frames;
        *self.page_index.borrow_mut() = index;
        self.next_frame_no.set(next);
        self.base_frame_no.set(1);
        self.seed.set(seed);
        if last_commit_end < size {
            self.file.truncate(last_commit_end)?;
        }
        Ok(())
    }

    pub fn next_frame(&self) -> u32 {
        self.next_frame_no.get()
    }

    /// The window a new reader may safely claim: `(oldest frame still in
    /// the log, newest committed frame)` (spec.md §4.2 "claiming a
    /// snapshot").
    pub fn read_snapshot_window(&self) -> Result<(u32, u32)> {
        self.sync_index()?;
        let last = self.next_frame_no.get().saturating_sub(1);
        Ok((self.base_frame_no.get(), last))
    }

    /// Catches this connection's in-memory frame index up to whatever a
    /// sibling process has appended to the log file since the last call
    /// (spec.md §4.3 "hash-index in shared memory"). A no-op unless
    /// `multi_proc` is set, since a single process's own appends already
    /// keep `frames`/`page_index` current.
    ///
    /// Only scans past committed frames already on disk; a tail left by a
    /// writer that hasn't committed yet is left alone rather than
    /// truncated, since that writer may be a different process still in
    /// the middle of `append_frame`. If the file has shrunk below what
    /// this connection already indexed, a sibling process must have reset
    /// or compacted the log since we last looked, and the only correct
    /// response is a full `recover()`.
    #[instrument(skip(self))]
    pub fn sync_index(&self) -> Result<()> {
        if !self.multi_proc.get() {
            return Ok(());
        }
        let size = self.file.size()?;
        let fsize = frame_size(self.page_size);
        let known_end = self
            .frames
            .borrow()
            .last()
            .map(|f| f.offset + fsize)
            .unwrap_or(0);
        if size < known_end {
            return self.recover();
        }
        if size < known_end + fsize {
            return Ok(());
        }

        let mut offset = known_end;
        let mut frame_no = self.next_frame_no.get();
        let mut seed = self.seed.get();
        let mut scanned: Vec<(FrameMeta, [u32; 2])> = Vec::new();
        let mut last_commit_end = known_end;
        while offset + fsize <= size {
            let raw = pread_exact(&self.io, &self.file, offset, fsize as usize)?;
            let header_bytes = &raw[0..WAL_FRAME_HEADER_SIZE];
            let body = &raw[WAL_FRAME_HEADER_SIZE..];
            let header = WalFrameHeader::deserialize(header_bytes);
            let header_sans_cksum = &header_bytes[0..12];
            let expected = WalFrameHeader::chain_checksum(seed, header_sans_cksum, body);
            if expected != header.cksum || header.pgno == 0 {
                break; // a sibling writer's commit frame hasn't landed yet
            }
            seed = expected;
            scanned.push((
                FrameMeta {
                    frame_no,
                    pgno: header.pgno,
                    offset,
                },
                seed,
            ));
            offset += fsize;
            if header.is_commit() {
                last_commit_end = offset;
            }
            frame_no += 1;
        }
        while let Some((last, _)) = scanned.last() {
            if last.offset >= last_commit_end {
                scanned.pop();
            } else {
                break;
            }
        }
        if scanned.is_empty() {
            return Ok(());
        }

        let new_next = scanned.last().unwrap().0.frame_no + 1;
        let new_seed = scanned.last().unwrap().1;
        let mut frames = self.frames.borrow_mut();
        let mut index = self.page_index.borrow_mut();
        for (meta, _) in scanned {
            index.entry(meta.pgno).or_default().push(meta.frame_no);
            frames.push(meta);
        }
        drop(frames);
        drop(index);
        self.next_frame_no.set(new_next);
        self.seed.set(new_seed);
        Ok(())
    }

    pub fn set_reader_slot(&self, slot: u32, first: u32, last: u32) -> Result<()> {
        let mut bytes = [0u8; 8];
        bytes[0..4].copy_from_slice(&first.to_be_bytes());
        bytes[4..8].copy_from_slice(&last.to_be_bytes());
        pwrite_all(&self.io, &self.shm, slot as u64 * 8, &bytes)
    }

    pub fn reader_slot(&self, slot: u32) -> Option<ReaderSlotView> {
        let bytes = pread_exact(&self.io, &self.shm, slot as u64 * 8, 8).ok()?;
        let first = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let last = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let view = ReaderSlotView { first, last };
        if view.is_active() {
            Some(view)
        } else {
            None
        }
    }

    pub fn all_reader_slots(&self) -> Vec<ReaderSlotView> {
        (0..N_READERS)
            .filter_map(|k| self.reader_slot(READER_BASE + k))
            .collect()
    }

    /// Looks up the newest version of `pgno` visible at or before
    /// `max_frame`, returning its page body, or `None` if the page has
    /// never been written to the log (the caller falls back to the
    /// database file).
    pub fn find_page(&self, pgno: u32, max_frame: u32) -> Result<Option<Vec<u8>>> {
        let frame_no = {
            let index = self.page_index.borrow();
            let Some(versions) = index.get(&pgno) else {
                return Ok(None);
            };
            versions.iter().rev().find(|&&f| f <= max_frame).copied()
        };
        let Some(frame_no) = frame_no else {
            return Ok(None);
        };
        let offset = {
            let frames = self.frames.borrow();
            frames
                .iter()
                .find(|f| f.frame_no == frame_no)
                .map(|f| f.offset)
                .ok_or_else(|| StorageError::InternalError("wal frame index desync".into()))?
        };
        let raw = pread_exact(
            &self.io,
            &self.file,
            offset + WAL_FRAME_HEADER_SIZE as u64,
            self.page_size as usize,
        )?;
        Ok(Some(raw))
    }

    /// Appends one frame to the log (spec.md §4.3 "Append"), chaining the
    /// rolling checksum and marking the frame as a commit when `is_commit`
    /// (the last frame of a transaction).
    #[instrument(skip(self, body))]
    pub fn append_frame(
        &self,
        pgno: u32,
        body: &[u8],
        is_commit: bool,
        new_size: u32,
        safety: SyncMode,
    ) -> Result<()> {
        debug_assert_eq!(body.len(), self.page_size as usize);
        let frame_no = self.next_frame_no.get();
        let region_offset =
            (frame_no - self.base_frame_no.get()) as u64 * frame_size(self.page_size);

        let header = WalFrameHeader {
            pgno,
            i_next: frame_no + 1,
            n_pg: if is_commit { new_size } else { 0 },
            cksum: [0, 0],
        };
        let mut header_bytes = [0u8; WAL_FRAME_HEADER_SIZE];
        header.serialize(&mut header_bytes);
        let cksum = WalFrameHeader::chain_checksum(self.seed.get(), &header_bytes[0..12], body);
        header_bytes[12..16].copy_from_slice(&cksum[0].to_be_bytes());
        header_bytes[16..20].copy_from_slice(&cksum[1].to_be_bytes());

        let mut frame_bytes = Vec::with_capacity(header_bytes.len() + body.len());
        frame_bytes.extend_from_slice(&header_bytes);
        frame_bytes.extend_from_slice(body);
        pwrite_all(&self.io, &self.file, region_offset, &frame_bytes)?;

        self.seed.set(cksum);
        self.frames.borrow_mut().push(FrameMeta {
            frame_no,
            pgno,
            offset: region_offset,
        });
        self.page_index
            .borrow_mut()
            .entry(pgno)
            .or_default()
            .push(frame_no);
        self.next_frame_no.set(frame_no + 1);

        if is_commit && !matches!(safety, SyncMode::Off) {
            file_sync(&self.io, &self.file)?;
        }
        Ok(())
    }

    /// Copies every frame up to the point no live reader still needs it
    /// into the database file (spec.md §4.3 "Checkpoint"). Leaves the
    /// newest `leave_frames` frames uncheckpointed even when no reader
    /// blocks them, so a caller doing periodic partial checkpoints can
    /// bound how much work one call does.
    #[instrument(skip(self, db))]
    pub fn checkpoint(
        &self,
        db: &dyn DatabaseStorage,
        page_size: u32,
        reader_slots: &[ReaderSlotView],
        leave_frames: u32,
    ) -> Result<CheckpointResult> {
        self.sync_index()?;
        let current_max = self.next_frame_no.get().saturating_sub(1);
        let reader_floor = reader_slots
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.last)
            .min();
        let safe_max = reader_floor.unwrap_or(current_max).min(current_max);
        let target_max = safe_max.saturating_sub(leave_frames);

        if target_max < self.base_frame_no.get() {
            return Ok(CheckpointResult {
                frames_checkpointed: 0,
                max_frame: self.base_frame_no.get().saturating_sub(1),
            });
        }

        // Only the newest version of each page up to target_max needs to
        // be written; walk frames in order and keep overwriting.
        let mut latest: HashMap<u32, u64> = HashMap::new();
        let mut count = 0u32;
        for f in self.frames.borrow().iter() {
            if f.frame_no > target_max {
                break;
            }
            latest.insert(f.pgno, f.offset);
            count += 1;
        }
        for (pgno, offset) in latest {
            let body = pread_exact(
                &self.io,
                &self.file,
                offset + WAL_FRAME_HEADER_SIZE as u64,
                page_size as usize,
            )?;
            db.write_page(pgno, page_size, &body)?;
        }
        db.sync()?;

        self.frames.borrow_mut().retain(|f| f.frame_no > target_max);
        self.page_index.borrow_mut().values_mut().for_each(|v| {
            v.retain(|&f| f > target_max);
        });
        self.page_index.borrow_mut().retain(|_, v| !v.is_empty());
        let reclaimable = target_max + 1 - self.base_frame_no.get();
        self.base_frame_no.set(target_max + 1);

        if self.frames.borrow().is_empty() && reader_floor.is_none() {
            self.file.truncate(0)?;
            self.next_frame_no.set(1);
            self.base_frame_no.set(1);
            self.seed.set([0, 0]);
        } else if reclaimable as u64 >= crate::config::BT_NWRAPLOG {
            self.compact()?;
        }

        Ok(CheckpointResult {
            frames_checkpointed: count,
            max_frame: target_max,
        })
    }

    /// Rewrites the remaining frames starting at byte 0, reclaiming the
    /// space held by already-checkpointed frames (the "wrap", spec.md §8
    /// `BT_NWRAPLOG`).
    fn compact(&self) -> Result<()> {
        let fsize = frame_size(self.page_size);
        let mut frames = self.frames.borrow_mut();
        let mut new_offset = 0u64;
        for f in frames.iter_mut() {
            if f.offset != new_offset {
                let raw = pread_exact(&self.io, &self.file, f.offset, fsize as usize)?;
                pwrite_all(&self.io, &self.file, new_offset, &raw)?;
            }
            f.offset = new_offset;
            new_offset += fsize;
        }
        self.file.truncate(new_offset)?;
        trace!(bytes_reclaimed = %new_offset, "compacted wal log");
        Ok(())
    }

    pub fn delete_files(&self) -> Result<()> {
        self.file.truncate(0)?;
        self.frames.borrow_mut().clear();
        self.page_index.borrow_mut().clear();
        self.next_frame_no.set(1);
        self.base_frame_no.set(1);
        self.seed.set([0, 0]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryIO, OpenFlags};
    use crate::storage::database::DatabaseFile;

    fn wal() -> (Wal, DatabaseFile, Arc<dyn IO>) {
        let io: Arc<dyn IO> = Arc::new(MemoryIO::new());
        let wal_file = io.open_file("db-wal", OpenFlags::Create).unwrap();
        let shm_file = io.open_shm("db-shm").unwrap();
        let db_file = io.open_file("db", OpenFlags::Create).unwrap();
        let db = DatabaseFile::new(db_file);
        let wal = Wal::open(io.clone(), wal_file, shm_file, 256, false).unwrap();
        (wal, db, io)
    }

    #[test]
    fn append_and_find_page() {
        let (wal, _db, _io) = wal();
        let body = vec![9u8; 256];
        wal.append_frame(1, &body, true, 1, SyncMode::Off).unwrap();
        let found = wal.find_page(1, 1).unwrap().unwrap();
        assert_eq!(found, body);
    }

    #[test]
    fn find_page_respects_snapshot_ceiling() {
        let (wal, _db, _io) = wal();
        wal.append_frame(1, &[1u8; 256], true, 1, SyncMode::Off)
            .unwrap();
        wal.append_frame(1, &[2u8; 256], true, 1, SyncMode::Off)
            .unwrap();
        assert_eq!(wal.find_page(1, 1).unwrap().unwrap(), vec![1u8; 256]);
        assert_eq!(wal.find_page(1, 2).unwrap().unwrap(), vec![2u8; 256]);
    }

    #[test_log::test]
    fn checkpoint_drains_frames_into_database() {
        let (wal, db, _io) = wal();
        wal.append_frame(1, &[7u8; 256], true, 1, SyncMode::Off)
            .unwrap();
        let result = wal.checkpoint(&db, 256, &[], 0).unwrap();
        assert_eq!(result.frames_checkpointed, 1);
        let mut out = vec![0u8; 256];
        db.read_page(1, 256, &mut out).unwrap();
        assert_eq!(out, vec![7u8; 256]);
    }

    #[test]
    fn checkpoint_leaves_frames_a_reader_still_needs() {
        let (wal, db, _io) = wal();
        wal.append_frame(1, &[1u8; 256], true, 1, SyncMode::Off)
            .unwrap();
        wal.append_frame(1, &[2u8; 256], true, 1, SyncMode::Off)
            .unwrap();
        let slots = vec![ReaderSlotView { first: 1, last: 1 }];
        let result = wal.checkpoint(&db, 256, &slots, 0).unwrap();
        assert_eq!(result.frames_checkpointed, 1);
        assert_eq!(wal.find_page(1, 2).unwrap().unwrap(), vec![2u8; 256]);
    }

    #[test_log::test]
    fn recover_discards_torn_tail() {
        let io: Arc<dyn IO> = Arc::new(MemoryIO::new());
        let wal_file = io.open_file("db-wal", OpenFlags::Create).unwrap();
        let shm_file = io.open_shm("db-shm").unwrap();
        {
            let wal = Wal::open(io.clone(), wal_file.clone(), shm_file.clone(), 256, false).unwrap();
            wal.append_frame(1, &[3u8; 256], true, 1, SyncMode::Off)
                .unwrap();
        }
        // Simulate a crashed writer mid-append: a few stray bytes appended
        // after the last valid, checksummed frame.
        pwrite_all(
            &io,
            &wal_file,
            (WAL_FRAME_HEADER_SIZE + 256) as u64,
            &[0xAAu8; 5],
        )
        .unwrap();
        let wal2 = Wal::open(io, wal_file, shm_file, 256, false).unwrap();
        assert_eq!(wal2.next_frame(), 2);
        assert_eq!(wal2.find_page(1, 1).unwrap().unwrap(), vec![3u8; 256]);
    }

    #[test]
    fn sync_index_picks_up_a_sibling_connections_commit() {
        let io: Arc<dyn IO> = Arc::new(MemoryIO::new());
        let wal_file = io.open_file("db-wal", OpenFlags::Create).unwrap();
        let shm_file = io.open_shm("db-shm").unwrap();
        let a = Wal::open(io.clone(), wal_file.clone(), shm_file.clone(), 256, true).unwrap();
        let b = Wal::open(io, wal_file, shm_file, 256, true).unwrap();

        a.append_frame(1, &[1u8; 256], true, 1, SyncMode::Off)
            .unwrap();
        assert_eq!(
            b.find_page(1, 1).unwrap(),
            None,
            "b hasn't synced yet, so it can't see a's commit"
        );
        let (_, last) = b.read_snapshot_window().unwrap();
        assert_eq!(last, 1, "read_snapshot_window syncs b's index first");
        assert_eq!(b.find_page(1, 1).unwrap().unwrap(), vec![1u8; 256]);
    }

    #[test]
    fn sync_index_is_a_no_op_without_multi_proc() {
        let io: Arc<dyn IO> = Arc::new(MemoryIO::new());
        let wal_file = io.open_file("db-wal", OpenFlags::Create).unwrap();
        let shm_file = io.open_shm("db-shm").unwrap();
        let a = Wal::open(io.clone(), wal_file.clone(), shm_file.clone(), 256, false).unwrap();
        let b = Wal::open(io, wal_file, shm_file, 256, false).unwrap();

        a.append_frame(1, &[1u8; 256], true, 1, SyncMode::Off)
            .unwrap();
        let (_, last) = b.read_snapshot_window().unwrap();
        assert_eq!(last, 0, "single-process mode never re-scans a sibling's appends");
    }
}
