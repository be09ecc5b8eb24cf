//! The pager (spec.md §4.4): page cache, transactions, savepoints, the
//! two free lists, and checkpoint orchestration.
//!
//! Adapted from the teacher's file of the same name: kept the `Page`
//! reference-counted/dirty-flag shape and the idea of a step-by-step
//! flush at commit, generalized to the spec's two free lists (page,
//! block) and savepoint stack, which the teacher's retrieved slice does
//! not implement. Ptrmap/autovacuum bookkeeping is dropped entirely —
//! the spec's free-list design (trunk-and-leaf, §3) has no pointer-map
//! concept, and autovacuum is the teacher's own feature, not named here.

use crate::config::PagerConfig;
use crate::io::IO;
use crate::lock_manager::{self, LockManager};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::database::{DatabaseFile, DatabaseStorage};
use crate::storage::ondisk::{DatabaseHeader, FreelistTrunk, DATABASE_HEADER_SIZE};
use crate::storage::page_cache::{CacheError, DumbLruPageCache, PageCacheKey};
use crate::storage::wal::{ReaderSlotView, Wal};
use crate::{Result, StorageError};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{instrument, trace};

/// A cached page: its bytes plus the bookkeeping the cache and cursors
/// need. Cursors "pin" a page by incrementing `ref_count`, which keeps it
/// out of LRU eviction (spec.md §3 "Ownership and lifecycle").
pub struct Page {
    pub id: u32,
    pub buf: RefCell<Vec<u8>>,
    pub dirty: Cell<bool>,
    pub ref_count: Cell<usize>,
}

pub type PageRef = Rc<Page>;

impl Page {
    fn new(id: u32, buf: Vec<u8>) -> PageRef {
        Rc::new(Page {
            id,
            buf: RefCell::new(buf),
            dirty: Cell::new(false),
            ref_count: Cell::new(0),
        })
    }

    pub fn pin(self: &PageRef) {
        self.ref_count.set(self.ref_count.get() + 1);
    }

    pub fn unpin(self: &PageRef) {
        let c = self.ref_count.get();
        debug_assert!(c > 0);
        self.ref_count.set(c.saturating_sub(1));
    }

    fn is_evictable(p: &PageRef) -> bool {
        p.ref_count.get() == 0 && !p.dirty.get()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FreeListKind {
    Page,
    Block,
}

/// One level of the savepoint stack (spec.md §4.4 "Savepoints"). Each
/// level lazily clones a page's pre-image the first time that level sees
/// it written.
struct SavepointLevel {
    level: u32,
    saved_pages: std::collections::HashMap<u32, Vec<u8>>,
    header_snapshot: DatabaseHeader,
}

/// State shared by every connection open against one database file: the
/// WAL, the lock manager, the underlying file, and the buffer pool. None
/// of this is versioned by transaction snapshot — it is the process-wide
/// "BtShared" spec.md §4.7 describes each `Connection` as cloning a
/// handle to, as distinct from the per-connection cache and header kept
/// on `Pager` itself (spec.md §3 "Ownership and lifecycle").
pub struct PagerShared {
    io: Arc<dyn IO>,
    db: DatabaseFile,
    wal: RefCell<Wal>,
    lock_manager: Arc<LockManager>,
    buffer_pool: Rc<BufferPool>,
    config: PagerConfig,
    log_size_callback: RefCell<Option<crate::config::LogSizeCallback>>,
}

impl PagerShared {
    fn open(
        io: Arc<dyn IO>,
        db_path: &str,
        wal_path: &str,
        shm_path: &str,
        config: PagerConfig,
    ) -> Result<Rc<Self>> {
        config.validate()?;
        let db_file = io.open_file(db_path, crate::io::OpenFlags::Create)?;
        let wal_file = io.open_file(wal_path, crate::io::OpenFlags::Create)?;
        let shm_file = io.open_shm(shm_path)?;
        let db = DatabaseFile::new(db_file);
        let lock_manager = Arc::new(LockManager::new(db.file().clone()));

        let existing_pages = db.size_pages(config.page_size)?;
        if existing_pages == 0 {
            let h = DatabaseHeader::new(config.page_size, config.block_size);
            let mut buf = vec![0u8; config.page_size as usize];
            h.serialize(&mut buf[0..DATABASE_HEADER_SIZE]);
            db.write_page(1, config.page_size, &buf)?;
            db.sync()?;
        }

        let wal = Wal::open(
            io.clone(),
            wal_file,
            shm_file,
            config.page_size,
            config.multi_proc,
        )?;

        Ok(Rc::new(Self {
            io,
            db,
            wal: RefCell::new(wal),
            lock_manager,
            buffer_pool: Rc::new(BufferPool::new(config.page_size as usize)),
            config,
            log_size_callback: RefCell::new(None),
        }))
    }

    /// Reads the database header straight off page 1 of the underlying
    /// file, bypassing any connection's cache — used to seed a fresh
    /// connection's header snapshot before it has joined a transaction.
    fn read_header_from_disk(&self) -> Result<DatabaseHeader> {
        let mut buf = vec![0u8; self.config.page_size as usize];
        self.db.read_page(1, self.config.page_size, &mut buf)?;
        DatabaseHeader::deserialize(&buf[0..DATABASE_HEADER_SIZE])
    }
}

pub struct Pager {
    shared: Rc<PagerShared>,
    cache: RefCell<DumbLruPageCache<PageRef>>,
    header: RefCell<DatabaseHeader>,
    /// Page numbers dirtied this transaction, in the order they were
    /// first written (spec.md §4.4: "the dirty list is drained in
    /// order").
    dirty_order: RefCell<Vec<u32>>,
    savepoints: RefCell<Vec<SavepointLevel>>,
    reader_slot: Cell<Option<u32>>,
    writer_held: Cell<bool>,
    frames_since_checkpoint: Cell<u32>,
}

/// Base savepoint level reserved for the implicit transaction; explicit
/// user savepoints start above it. (Open question resolved in
/// DESIGN.md: the spec's "levels >= 3" is the teacher's own internal
/// numbering, not an externally meaningful constant, so only the
/// existence of a reserved base level is preserved here.)
const BASE_SAVEPOINT_LEVEL: u32 = 0;

impl Pager {
    #[instrument(skip(io))]
    pub fn open(
        io: Arc<dyn IO>,
        db_path: &str,
        wal_path: &str,
        shm_path: &str,
        config: PagerConfig,
    ) -> Result<Self> {
        let shared = PagerShared::open(io, db_path, wal_path, shm_path, config)?;
        let pager = Self::for_shared(shared)?;
        pager.connect()?;
        Ok(pager)
    }

    /// Opens an additional connection against a database another `Pager`
    /// already has open, sharing its WAL, lock manager and file but
    /// starting with its own empty page cache and a header snapshot read
    /// fresh off disk (spec.md §4.7, §5 "Roles and concurrency": distinct
    /// connections, each able to hold its own read snapshot).
    pub fn connect_additional(shared: &Rc<PagerShared>) -> Result<Self> {
        let pager = Self::for_shared(shared.clone())?;
        pager.connect()?;
        Ok(pager)
    }

    fn for_shared(shared: Rc<PagerShared>) -> Result<Self> {
        let header = shared.read_header_from_disk()?;
        Ok(Self {
            shared,
            cache: RefCell::new(DumbLruPageCache::new(2000)),
            header: RefCell::new(header),
            dirty_order: RefCell::new(Vec::new()),
            savepoints: RefCell::new(Vec::new()),
            reader_slot: Cell::new(None),
            writer_held: Cell::new(false),
            frames_since_checkpoint: Cell::new(0),
        })
    }

    /// A handle to this pager's shared state, for constructing further
    /// connections against the same database (`Pager::connect_additional`).
    pub fn shared(&self) -> Rc<PagerShared> {
        self.shared.clone()
    }

    pub fn set_log_size_callback(&self, cb: crate::config::LogSizeCallback) {
        *self.shared.log_size_callback.borrow_mut() = Some(cb);
    }

    pub fn page_size(&self) -> u32 {
        self.header.borrow().page_size
    }

    pub fn block_size(&self) -> u32 {
        self.header.borrow().block_size
    }

    pub fn pages_per_block(&self) -> u32 {
        self.shared.config.pages_per_block()
    }

    /// `nMinMerge` (spec.md §4.6): minimum run of consecutive levels at an
    /// age before a merge is scheduled.
    pub fn min_merge(&self) -> u32 {
        self.shared.config.min_merge
    }

    pub fn header(&self) -> DatabaseHeader {
        self.header.borrow().clone()
    }

    /// Connect handshake (spec.md §4.2): runs recovery if this connection
    /// wins the race.
    fn connect(&self) -> Result<()> {
        let read_write = true;
        let outcome = self
            .shared
            .lock_manager
            .connect(read_write, || self.shared.wal.borrow_mut().recover())?;
        if outcome.ran_recovery {
            trace!("ran WAL recovery on connect");
        }
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.shared.lock_manager.disconnect(
            true,
            || self.run_checkpoint(0).map(|_| ()),
            || self.shared.wal.borrow_mut().delete_files(),
        )
    }

    /// Drops this connection's cached pages and re-reads the header so
    /// the next transaction sees a snapshot resolved through its own
    /// reader bound rather than whatever another connection last left in
    /// this connection's cache (spec.md §8 scenario 2: a reader must
    /// never observe a writer's uncommitted pages nor miss its own
    /// snapshot's version on a stale cache hit).
    fn refresh_snapshot(&self) -> Result<()> {
        self.cache.borrow_mut().clear();
        let page1 = self.get_page(1)?;
        let h = DatabaseHeader::deserialize(&page1.buf.borrow()[0..DATABASE_HEADER_SIZE])?;
        *self.header.borrow_mut() = h;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Page cache
    // ---------------------------------------------------------------

    /// Fetches a page, consulting the cache, then the WAL (bounded by the
    /// current read snapshot), then the database file (spec.md §2
    /// "Data-flow on a read").
    pub fn get_page(&self, page_no: u32) -> Result<PageRef> {
        let key = PageCacheKey::new(page_no);
        if let Some(p) = self.cache.borrow_mut().get(&key) {
            return Ok(p);
        }
        let page_size = self.page_size();
        let mut buf = self.shared.buffer_pool.get();
        let max_frame = self.reader_slot.get().map(|_| self.visible_frame());
        let from_wal = self
            .shared
            .wal
            .borrow()
            .find_page(page_no, max_frame.unwrap_or(u32::MAX))?;
        if let Some(bytes) = from_wal {
            buf.copy_from_slice(&bytes);
        } else {
            self.shared.db.read_page(page_no, page_size, &mut buf)?;
        }
        let page = Page::new(page_no, buf);
        self.cache_insert(key, page.clone())?;
        Ok(page)
    }

    fn cache_insert(&self, key: PageCacheKey, page: PageRef) -> Result<()> {
        match self
            .cache
            .borrow_mut()
            .insert(key, page, Page::is_evictable)
        {
            Ok(()) => Ok(()),
            Err(CacheError::KeyExists) => Ok(()), // raced with a concurrent fetch; harmless
            Err(CacheError::Full) => Err(StorageError::InternalError(
                "page cache full: no evictable page".into(),
            )),
        }
    }

    /// Visible WAL frame horizon for reads under the current snapshot.
    fn visible_frame(&self) -> u32 {
        self.reader_slot
            .get()
            .and_then(|slot| self.shared.wal.borrow().reader_slot(slot))
            .map(|s| s.last)
            .unwrap_or(0)
    }

    /// Clones the page's pre-image into every active savepoint level that
    /// hasn't seen it yet, marks it dirty, and appends it to the ordered
    /// dirty list the first time this transaction touches it (spec.md
    /// §4.4 "Savepoints": "a page is cloned lazily the first time it is
    /// written under that level").
    pub fn make_writable(&self, page: &PageRef) -> Result<()> {
        for level in self.savepoints.borrow_mut().iter_mut() {
            level
                .saved_pages
                .entry(page.id)
                .or_insert_with(|| page.buf.borrow().clone());
        }
        if !page.dirty.get() {
            page.dirty.set(true);
            self.dirty_order.borrow_mut().push(page.id);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Free lists (spec.md §4.4 "Free-list ops")
    // ---------------------------------------------------------------

    fn trunk_root(&self, kind: FreeListKind) -> u32 {
        let h = self.header.borrow();
        match kind {
            FreeListKind::Page => h.freelist_trunk_page,
            FreeListKind::Block => h.freelist_trunk_block,
        }
    }

    fn set_trunk_root(&self, kind: FreeListKind, pgno: u32) {
        let mut h = self.header.borrow_mut();
        match kind {
            FreeListKind::Page => h.freelist_trunk_page = pgno,
            FreeListKind::Block => h.freelist_trunk_block = pgno,
        }
    }

    /// `freelistAdd(bBlock, pgno)` (spec.md §4.4): if the current first
    /// trunk has room, append; else mint `pgno` itself as the new trunk,
    /// linking to the old one.
    pub fn freelist_add(&self, kind: FreeListKind, pgno: u32) -> Result<()> {
        let capacity = FreelistTrunk::capacity(self.page_size() as usize);
        let trunk = self.trunk_root(kind);
        if trunk == 0 {
            let page = self.get_page(pgno)?;
            self.make_writable(&page)?;
            {
                let mut buf = page.buf.borrow_mut();
                FreelistTrunk::init(&mut buf);
                FreelistTrunk::set_n_free(&mut buf, 0);
                FreelistTrunk::set_next(&mut buf, 0);
            }
            self.set_trunk_root(kind, pgno);
            self.persist_header()?;
            return Ok(());
        }
        let trunk_page = self.get_page(trunk)?;
        let n_free = FreelistTrunk::n_free(&trunk_page.buf.borrow());
        if (n_free as usize) < capacity {
            self.make_writable(&trunk_page)?;
            let mut buf = trunk_page.buf.borrow_mut();
            FreelistTrunk::set_entry(&mut buf, n_free as usize, pgno);
            FreelistTrunk::set_n_free(&mut buf, n_free + 1);
        } else {
            let new_trunk = self.get_page(pgno)?;
            self.make_writable(&new_trunk)?;
            {
                let mut buf = new_trunk.buf.borrow_mut();
                FreelistTrunk::init(&mut buf);
                FreelistTrunk::set_n_free(&mut buf, 0);
                FreelistTrunk::set_next(&mut buf, trunk);
            }
            self.set_trunk_root(kind, pgno);
            self.persist_header()?;
        }
        Ok(())
    }

    /// `freelistAlloc(bBlock)` (spec.md §4.4): pop an entry from the
    /// trunk; if it empties, the page-list returns the trunk page itself,
    /// while the block-list cascades the now-bare trunk page onto the
    /// page list and continues down the chain.
    pub fn freelist_alloc(&self, kind: FreeListKind) -> Result<Option<u32>> {
        loop {
            let trunk = self.trunk_root(kind);
            if trunk == 0 {
                return Ok(None);
            }
            let trunk_page = self.get_page(trunk)?;
            let n_free = FreelistTrunk::n_free(&trunk_page.buf.borrow());
            if n_free > 0 {
                self.make_writable(&trunk_page)?;
                let pgno = {
                    let mut buf = trunk_page.buf.borrow_mut();
                    let v = FreelistTrunk::entry(&buf, n_free as usize - 1);
                    FreelistTrunk::set_n_free(&mut buf, n_free - 1);
                    v
                };
                return Ok(Some(pgno));
            }
            let next = FreelistTrunk::next(&trunk_page.buf.borrow());
            match kind {
                FreeListKind::Page => {
                    self.set_trunk_root(kind, next);
                    self.persist_header()?;
                    return Ok(Some(trunk));
                }
                FreeListKind::Block => {
                    self.set_trunk_root(kind, next);
                    self.persist_header()?;
                    self.freelist_add(FreeListKind::Page, trunk)?;
                    // loop again: try the next trunk for a block entry
                }
            }
        }
    }

    pub fn free_page(&self, pgno: u32) -> Result<()> {
        self.freelist_add(FreeListKind::Page, pgno)?;
        self.cache.borrow_mut().remove(&PageCacheKey::new(pgno));
        Ok(())
    }

    pub fn free_block(&self, block_start: u32) -> Result<()> {
        self.freelist_add(FreeListKind::Block, block_start)
    }

    /// Allocates a page: free-list leaf/trunk first, else append at EOF
    /// (spec.md §3 "Free lists").
    pub fn allocate_page(&self) -> Result<PageRef> {
        if let Some(pgno) = self.freelist_alloc(FreeListKind::Page)? {
            let page = self.get_page(pgno)?;
            self.make_writable(&page)?;
            page.buf.borrow_mut().fill(0);
            return Ok(page);
        }
        let pgno = {
            let mut h = self.header.borrow_mut();
            h.page_count += 1;
            h.page_count
        };
        self.persist_header()?;
        let page = Page::new(pgno, vec![0u8; self.page_size() as usize]);
        self.make_writable(&page)?;
        self.cache_insert(PageCacheKey::new(pgno), page.clone())?;
        Ok(page)
    }

    /// Allocates `pages_per_block` contiguous pages for a fast-insert
    /// sub-tree block (spec.md §4.6), returning the first page number.
    /// Minted blocks are always a contiguous run bumped straight off EOF
    /// (spec.md §3 glossary: "Block: a fixed-size group of contiguous
    /// pages") — going through `allocate_page` page-by-page would let
    /// any one of its calls be satisfied from the page free list instead
    /// of EOF, breaking that contiguity.
    pub fn allocate_block(&self) -> Result<u32> {
        if let Some(start) = self.freelist_alloc(FreeListKind::Block)? {
            return Ok(start);
        }
        let n = self.pages_per_block();
        let first = {
            let mut h = self.header.borrow_mut();
            let first = h.page_count + 1;
            h.page_count += n;
            first
        };
        self.persist_header()?;
        for pgno in first..first + n {
            let page = Page::new(pgno, vec![0u8; self.page_size() as usize]);
            self.make_writable(&page)?;
            self.cache_insert(PageCacheKey::new(pgno), page)?;
        }
        Ok(first)
    }

    // ---------------------------------------------------------------
    // Header
    // ---------------------------------------------------------------

    pub fn with_header_mut<R>(&self, f: impl FnOnce(&mut DatabaseHeader) -> R) -> Result<R> {
        let r = {
            let mut h = self.header.borrow_mut();
            f(&mut h)
        };
        self.persist_header()?;
        Ok(r)
    }

    fn persist_header(&self) -> Result<()> {
        let page1 = self.get_page(1)?;
        self.make_writable(&page1)?;
        let h = self.header.borrow().clone();
        let mut buf = page1.buf.borrow_mut();
        h.serialize(&mut buf[0..DATABASE_HEADER_SIZE]);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------

    #[instrument(skip(self))]
    pub fn begin_read(&self) -> Result<()> {
        for _ in 0..8 {
            let (first, last) = self.shared.wal.borrow().read_snapshot_window()?;
            let slot = self
                .shared
                .lock_manager
                .claim_reader_slot()?
                .ok_or_else(lock_manager::busy_err)?;
            self.shared
                .wal
                .borrow_mut()
                .set_reader_slot(slot, first, last)?;
            let (first2, _) = self.shared.wal.borrow().read_snapshot_window()?;
            if first2 == first {
                self.reader_slot.set(Some(slot));
                self.refresh_snapshot()?;
                return Ok(());
            }
            self.shared.lock_manager.release_reader_slot(slot)?;
        }
        Err(StorageError::Protocol)
    }

    pub fn end_read(&self) -> Result<()> {
        if let Some(slot) = self.reader_slot.take() {
            self.shared.lock_manager.release_reader_slot(slot)?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn begin_write(&self) -> Result<()> {
        if !self.shared.lock_manager.try_exclusive(lock_manager::WRITER)? {
            return Err(StorageError::Busy);
        }
        self.writer_held.set(true);
        self.shared.wal.borrow().sync_index()?;
        self.refresh_snapshot()?;
        self.dirty_order.borrow_mut().clear();
        self.savepoints.borrow_mut().clear();
        self.savepoints.borrow_mut().push(SavepointLevel {
            level: BASE_SAVEPOINT_LEVEL,
            saved_pages: Default::default(),
            header_snapshot: self.header(),
        });
        Ok(())
    }

    /// Pushes a new savepoint level above the current top.
    pub fn savepoint_begin(&self) -> u32 {
        let mut sps = self.savepoints.borrow_mut();
        let level = sps
            .last()
            .map(|s| s.level + 1)
            .unwrap_or(BASE_SAVEPOINT_LEVEL);
        sps.push(SavepointLevel {
            level,
            saved_pages: Default::default(),
            header_snapshot: self.header(),
        });
        level
    }

    /// Rolls back to `level`: restores every saved pre-image at or above
    /// it (most-recent level first), reverts the cached header, and
    /// drops those levels from the stack (spec.md §4.4 "Rollback of level
    /// K").
    pub fn savepoint_rollback(&self, level: u32) -> Result<()> {
        let mut header_to_restore = None;
        let mut to_restore: Vec<(u32, Vec<u8>)> = Vec::new();
        {
            let mut sps = self.savepoints.borrow_mut();
            while let Some(top) = sps.last() {
                if top.level < level {
                    break;
                }
                let popped = sps.pop().unwrap();
                header_to_restore = Some(popped.header_snapshot.clone());
                for (pgno, bytes) in popped.saved_pages {
                    // Only the first (outermost, earliest-captured) image
                    // for a page matters; a page still dirtied at a lower
                    // level keeps the newer levels' edits reverted but
                    // stays live there.
                    if !to_restore.iter().any(|(p, _)| *p == pgno) {
                        to_restore.push((pgno, bytes));
                    }
                }
            }
        }
        for (pgno, bytes) in to_restore {
            let page = self.get_page(pgno)?;
            *page.buf.borrow_mut() = bytes;
            page.dirty.set(true);
        }
        if let Some(h) = header_to_restore {
            *self.header.borrow_mut() = h;
        }
        Ok(())
    }

    /// Drains the dirty list to the WAL in order, the last frame bearing
    /// the commit marker (spec.md §4.4 "On commit the dirty list is
    /// drained in order").
    #[instrument(skip(self))]
    pub fn commit(&self) -> Result<()> {
        let dirty: Vec<u32> = self.dirty_order.borrow_mut().drain(..).collect();
        let n = dirty.len();
        let new_size = self.header.borrow().page_count;
        for (i, pgno) in dirty.iter().enumerate() {
            let page = self.get_page(*pgno)?;
            let is_last = i + 1 == n;
            let bytes = page.buf.borrow().clone();
            self.shared.wal.borrow_mut().append_frame(
                *pgno,
                &bytes,
                is_last,
                new_size,
                self.shared.config.safety,
            )?;
            page.dirty.set(false);
        }
        self.savepoints.borrow_mut().clear();
        if n > 0 {
            let frames = self.shared.wal.borrow().next_frame().saturating_sub(1);
            if let Some(cb) = self.shared.log_size_callback.borrow().as_ref() {
                cb(frames as u64);
            }
            self.frames_since_checkpoint
                .set(self.frames_since_checkpoint.get() + n as u32);
        }
        self.shared
            .lock_manager
            .release_exclusive(lock_manager::WRITER)?;
        self.writer_held.set(false);
        if self.shared.config.auto_checkpoint_frames > 0
            && self.frames_since_checkpoint.get() >= self.shared.config.auto_checkpoint_frames
        {
            self.run_checkpoint(0)?;
            self.frames_since_checkpoint.set(0);
        }
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.savepoint_rollback(BASE_SAVEPOINT_LEVEL)?;
        for pgno in self.dirty_order.borrow_mut().drain(..) {
            self.cache.borrow_mut().remove(&PageCacheKey::new(pgno));
        }
        self.shared
            .lock_manager
            .release_exclusive(lock_manager::WRITER)?;
        self.writer_held.set(false);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Checkpoint (spec.md §4.3 "Checkpoint")
    // ---------------------------------------------------------------

    #[instrument(skip(self))]
    pub fn run_checkpoint(&self, leave_frames: u32) -> Result<u32> {
        let guard = match lock_manager::checkpointer_guard(&self.shared.lock_manager)? {
            Some(g) => g,
            None => return Ok(0), // another connection is already checkpointing
        };
        let slots: Vec<ReaderSlotView> = self.shared.wal.borrow().all_reader_slots();
        let page_size = self.page_size();
        let result = self.shared.wal.borrow_mut().checkpoint(
            &self.shared.db,
            page_size,
            &slots,
            leave_frames,
        )?;
        if result.frames_checkpointed > 0 {
            let mut full = vec![0u8; page_size as usize];
            self.shared.db.read_page(1, page_size, &mut full)?;
            if let Ok(h) = DatabaseHeader::deserialize(&full[0..DATABASE_HEADER_SIZE]) {
                *self.header.borrow_mut() = h;
            }
            self.shared.db.sync()?;
        }
        guard.release()?;
        Ok(result.frames_checkpointed)
    }

    pub fn is_write_in_progress(&self) -> bool {
        self.writer_held.get()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.shared.lock_manager
    }

    pub fn io(&self) -> &Arc<dyn IO> {
        &self.shared.io
    }

    pub fn database_storage(&self) -> &DatabaseFile {
        &self.shared.db
    }

    /// All page numbers currently resident in cache (diagnostics/tests).
    pub fn cached_page_numbers(&self) -> HashSet<u32> {
        self.cache.borrow().iter_values().map(|p| p.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIO;

    fn pager() -> Pager {
        let io: Arc<dyn IO> = Arc::new(MemoryIO::new());
        Pager::open(io, "db", "db-wal", "db-shm", PagerConfig::default()).unwrap()
    }

    #[test]
    fn fresh_database_has_page_one() {
        let p = pager();
        assert_eq!(p.header().page_count, 1);
    }

    #[test]
    fn allocate_and_commit_roundtrips() {
        let p = pager();
        p.begin_write().unwrap();
        let page = p.allocate_page().unwrap();
        let pgno = page.id;
        page.buf.borrow_mut()[0] = 0xAB;
        p.make_writable(&page).unwrap();
        p.commit().unwrap();

        p.begin_read().unwrap();
        let page2 = p.get_page(pgno).unwrap();
        assert_eq!(page2.buf.borrow()[0], 0xAB);
        p.end_read().unwrap();
    }

    #[test]
    fn freed_page_is_reused() {
        let p = pager();
        p.begin_write().unwrap();
        let page = p.allocate_page().unwrap();
        let pgno = page.id;
        p.commit().unwrap();

        p.begin_write().unwrap();
        p.free_page(pgno).unwrap();
        let page2 = p.allocate_page().unwrap();
        assert_eq!(page2.id, pgno);
        p.commit().unwrap();
    }

    #[test]
    fn savepoint_rollback_restores_bytes() {
        let p = pager();
        p.begin_write().unwrap();
        let page = p.allocate_page().unwrap();
        let pgno = page.id;
        page.buf.borrow_mut()[0] = 1;
        p.make_writable(&page).unwrap();
        p.commit().unwrap();

        p.begin_write().unwrap();
        let sp = p.savepoint_begin();
        let page = p.get_page(pgno).unwrap();
        p.make_writable(&page).unwrap();
        page.buf.borrow_mut()[0] = 2;
        p.savepoint_rollback(sp).unwrap();
        let page = p.get_page(pgno).unwrap();
        assert_eq!(page.buf.borrow()[0], 1);
        p.rollback().unwrap();
    }
}
