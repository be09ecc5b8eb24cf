//! A transactional key-value storage engine organized as a fast-insert
//! log-structured B-tree (spec.md §1): a pager with a write-ahead log,
//! a B-tree with large-value overflow, and a meta-tree/merge engine
//! that lets writes land cheaply and get consolidated in the
//! background.
//!
//! Adapted from the teacher's top-level `lib.rs` (`Database`/`Connection`
//! split, module wiring, global allocator), trimmed of the SQL/VDBE
//! surface — parsing, schema, query planning and bytecode execution are
//! out of scope here (spec.md §1 "Explicitly out of scope") — and
//! replaced with the `KvCursor`-based API this core exposes directly
//! (spec.md §4.7, §6.1).

mod config;
mod error;
mod io;
mod lock_manager;
mod storage;
mod types;

#[cfg(not(target_family = "wasm"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::rc::Rc;
use std::sync::Arc;
use storage::btree::BTreeCursor;
use storage::fitree;
use storage::pager::Pager;
use tracing::instrument;

pub use config::{LogSizeCallback, PagerConfig, SyncMode};
pub use error::{IoErrorKind, Result, StorageError};
pub use io::{Buffer, Completion, File, LockMode, OpenFlags, IO};
#[cfg(feature = "fs")]
pub use io::PlatformIO;
pub use io::MemoryIO;
pub use storage::fitree::MetaCursor;
pub use types::{AgeLevel, CursorResult, Key, SeekOp, SeekResult, Value};

/// The shared cursor API (spec.md §6.1): implemented both by the
/// B-tree's own cursor and by the FI-tree's meta-tree cursor, so a
/// caller that only needs ordered scan/seek doesn't need to care which
/// tree it is walking.
pub trait KvCursor {
    fn seek(&mut self, key: &[u8], op: SeekOp) -> Result<CursorResult<SeekResult>>;
    fn first(&mut self) -> Result<CursorResult<bool>>;
    fn last(&mut self) -> Result<CursorResult<bool>>;
    fn next(&mut self) -> Result<CursorResult<bool>>;
    fn prev(&mut self) -> Result<CursorResult<bool>>;
    fn key(&self) -> Option<Key>;
    fn value(&self) -> Result<CursorResult<Option<Value>>>;
    fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<CursorResult<()>>;
    fn delete(&mut self) -> Result<CursorResult<()>>;
}

/// The handle used to open a database and mint connections against it.
/// `Database` itself owns one connection's worth of pager state (used to
/// create the main tree root and to run the disconnect protocol on
/// drop); every `Connection`, including the one implied by `Database`
/// opening the file, shares the same underlying WAL, lock manager and
/// file through `Pager::shared` (spec.md §4.2, §4.7) while keeping its
/// own page cache and header snapshot.
pub struct Database {
    pager: Rc<Pager>,
}

impl Database {
    /// Opens (creating if necessary) a database backed by the given
    /// `IO` shim and paths, and ensures the authoritative main tree's
    /// root exists (spec.md §4.6 "The main B-tree (root `iRoot`) is the
    /// authoritative store").
    #[instrument(skip(io, config))]
    pub fn open(
        io: Arc<dyn IO>,
        db_path: &str,
        wal_path: &str,
        shm_path: &str,
        config: PagerConfig,
    ) -> Result<Self> {
        let pager = Rc::new(Pager::open(io, db_path, wal_path, shm_path, config)?);
        fitree::ensure_main_root(&pager)?;
        Ok(Self { pager })
    }

    /// Convenience constructor over the platform `IO` shim, deriving the
    /// conventional `<path>-wal`/`<path>-shm` sibling paths.
    #[cfg(feature = "fs")]
    pub fn open_file(path: &str, config: PagerConfig) -> Result<Self> {
        let io: Arc<dyn IO> = Arc::new(PlatformIO::new()?);
        let wal_path = format!("{path}-wal");
        let shm_path = format!("{path}-shm");
        Self::open(io, path, &wal_path, &shm_path, config)
    }

    /// Opens a fresh in-memory database, mainly for tests and embedders
    /// that don't need durability across process restarts.
    pub fn open_memory(config: PagerConfig) -> Result<Self> {
        let io: Arc<dyn IO> = Arc::new(MemoryIO::new());
        Self::open(io, "db", "db-wal", "db-shm", config)
    }

    /// A new connection sharing this database's WAL, lock manager and
    /// file, but with its own page cache and header snapshot (spec.md §5
    /// "Roles and concurrency": any number of connections, at most one
    /// of them a writer at a time; spec.md §4.7: each connection clones
    /// the shared handle rather than the pager itself, so one
    /// connection's mid-transaction state is never visible to another's
    /// cache).
    pub fn connect(&self) -> Result<Connection> {
        let pager = Rc::new(Pager::connect_additional(&self.pager.shared())?);
        Ok(Connection { pager })
    }

    pub fn set_log_size_callback(&self, cb: LogSizeCallback) {
        self.pager.set_log_size_callback(cb);
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Best-effort: the disconnect protocol (spec.md §4.2) already
        // tolerates being skipped by a crashed process, so a failure
        // here just means the next connect() pays for recovery/cleanup.
        let _ = self.pager.disconnect();
    }
}

/// One connection's view onto a `Database`: its own transaction state
/// (the pager's, since savepoints/dirty-list are per-writer, not
/// per-connection-object) and cursor set.
pub struct Connection {
    pager: Rc<Pager>,
}

impl Connection {
    pub fn begin_read(&self) -> Result<()> {
        self.pager.begin_read()
    }

    pub fn end_read(&self) -> Result<()> {
        self.pager.end_read()
    }

    pub fn begin_write(&self) -> Result<()> {
        self.pager.begin_write()
    }

    /// Commits the current write transaction, then runs merge
    /// integration (spec.md §4.6 "Merge integration... by a writer at
    /// commit time") if the checkpointer has a merge waiting.
    #[instrument(skip(self))]
    pub fn commit(&self) -> Result<()> {
        fitree::maybe_integrate(&self.pager)?;
        self.pager.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.pager.rollback()
    }

    /// Runs a checkpoint, which also executes any merge the schedule
    /// page has queued (spec.md §4.6 "Merge execution... run by the
    /// checkpointer", spec.md §4.3 "Checkpoint").
    #[instrument(skip(self))]
    pub fn checkpoint(&self, leave_frames: u32) -> Result<u32> {
        let frames = self.pager.run_checkpoint(leave_frames)?;
        fitree::run_merge(&self.pager)?;
        Ok(frames)
    }

    /// Opens a named savepoint; rolls back automatically on `Drop`
    /// unless `release`d (spec.md §4.4 "Savepoints").
    pub fn savepoint(&self) -> Savepoint<'_> {
        let level = self.pager.savepoint_begin();
        Savepoint {
            conn: self,
            level,
            released: false,
        }
    }

    /// Point lookup through the FI-tree's layered read path (spec.md §2
    /// "Data-flow on a read").
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        fitree::get(&self.pager, key)
    }

    /// Fast-insert write (spec.md §4.6): lands in the current sub-tree
    /// rather than the main tree, sealing and scheduling a merge once
    /// the sub-tree has grown by about a block's worth of pages.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        fitree::fast_write(&self.pager, key, Some(value))
    }

    /// Fast-insert delete: records a tombstone rather than mutating the
    /// main tree directly, so the deletion is preserved through merges
    /// (spec.md §4.6 "preserving delete markers").
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        fitree::fast_write(&self.pager, key, None)
    }

    /// A cursor over the authoritative main tree (spec.md §4.6 "The
    /// main B-tree (root `iRoot`) is the authoritative store").
    pub fn main_tree_cursor(&self) -> BTreeCursor {
        BTreeCursor::new(self.pager.clone(), self.pager.header().root_page)
    }

    /// A cursor over the meta-tree itself (spec.md §6.1), for callers
    /// that need to inspect sub-tree roots directly rather than go
    /// through the layered `get`.
    pub fn meta_tree_cursor(&self) -> MetaCursor {
        MetaCursor::new(&self.pager, self.pager.header().meta_root)
    }
}

/// RAII guard for one savepoint level (spec.md §4.4 "Savepoints"):
/// rolls back to the level it was opened at if dropped without calling
/// `release`.
pub struct Savepoint<'a> {
    conn: &'a Connection,
    level: u32,
    released: bool,
}

impl Savepoint<'_> {
    /// Keeps this savepoint's writes; they fold into whatever level (or
    /// transaction) encloses it.
    pub fn release(mut self) {
        self.released = true;
    }
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.conn.pager.savepoint_rollback(self.level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Database {
        Database::open_memory(PagerConfig::default()).unwrap()
    }

    #[test]
    fn put_get_remove_roundtrip() {
        let db = memory_db();
        let conn = db.connect().unwrap();
        conn.begin_write().unwrap();
        conn.put(b"a", b"1").unwrap();
        conn.commit().unwrap();

        conn.begin_read().unwrap();
        assert_eq!(conn.get(b"a").unwrap(), Some(b"1".to_vec()));
        conn.end_read().unwrap();

        conn.begin_write().unwrap();
        conn.remove(b"a").unwrap();
        conn.commit().unwrap();

        conn.begin_read().unwrap();
        assert_eq!(conn.get(b"a").unwrap(), None);
        conn.end_read().unwrap();
    }

    #[test]
    fn savepoint_rolls_back_unreleased() {
        let db = memory_db();
        let conn = db.connect().unwrap();
        conn.begin_write().unwrap();
        conn.put(b"a", b"1").unwrap();
        {
            let sp = conn.savepoint();
            conn.put(b"a", b"2").unwrap();
            drop(sp);
        }
        conn.put(b"b", b"3").unwrap();
        conn.commit().unwrap();

        conn.begin_read().unwrap();
        assert_eq!(conn.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(conn.get(b"b").unwrap(), Some(b"3".to_vec()));
        conn.end_read().unwrap();
    }

    #[test]
    fn savepoint_release_keeps_writes() {
        let db = memory_db();
        let conn = db.connect().unwrap();
        conn.begin_write().unwrap();
        let sp = conn.savepoint();
        conn.put(b"a", b"1").unwrap();
        sp.release();
        conn.commit().unwrap();

        conn.begin_read().unwrap();
        assert_eq!(conn.get(b"a").unwrap(), Some(b"1".to_vec()));
        conn.end_read().unwrap();
    }

    #[test]
    fn two_connections_share_one_database() {
        let db = memory_db();
        let a = db.connect().unwrap();
        let b = db.connect().unwrap();

        a.begin_write().unwrap();
        a.put(b"shared", b"v").unwrap();
        a.commit().unwrap();

        b.begin_read().unwrap();
        assert_eq!(b.get(b"shared").unwrap(), Some(b"v".to_vec()));
        b.end_read().unwrap();
    }

    /// spec.md §8 scenario 2: a reader's snapshot must stay fixed at the
    /// frame horizon it began with, even after another connection commits
    /// again and even once the reader has already cached the page that
    /// later write touches.
    #[test]
    fn reader_snapshot_is_unaffected_by_a_later_writer_commit() {
        let db = memory_db();
        let a = db.connect().unwrap();
        let b = db.connect().unwrap();

        a.begin_write().unwrap();
        a.put(b"x", b"1").unwrap();
        a.commit().unwrap();

        b.begin_read().unwrap();
        assert_eq!(b.get(b"x").unwrap(), Some(b"1".to_vec()));

        a.begin_write().unwrap();
        a.put(b"x", b"2").unwrap();
        a.commit().unwrap();

        assert_eq!(
            b.get(b"x").unwrap(),
            Some(b"1".to_vec()),
            "b's snapshot predates a's second commit and must not see it"
        );
        b.end_read().unwrap();

        b.begin_read().unwrap();
        assert_eq!(b.get(b"x").unwrap(), Some(b"2".to_vec()));
        b.end_read().unwrap();
    }

    #[test]
    fn checkpoint_runs_without_a_pending_merge() {
        let db = memory_db();
        let conn = db.connect().unwrap();
        conn.begin_write().unwrap();
        conn.put(b"a", b"1").unwrap();
        conn.commit().unwrap();
        conn.checkpoint(0).unwrap();

        conn.begin_read().unwrap();
        assert_eq!(conn.get(b"a").unwrap(), Some(b"1".to_vec()));
        conn.end_read().unwrap();
    }
}
