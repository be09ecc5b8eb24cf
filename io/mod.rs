//! The OS shim (spec.md §4.1): file I/O, positional read/write, sync,
//! sector-size query, advisory byte-range locks, and shared-memory
//! mapping. Adapted from the teacher's `io/mod.rs` (`File`/`IO` traits,
//! `Completion`, `Buffer`, `OpenFlags`, `cfg_block!` platform dispatch),
//! extended with the locking and shared-memory primitives the spec's
//! multi-process lock manager (§4.2) and WAL (§4.3) require and the
//! teacher's single-process core does not.

use crate::error::IoErrorKind;
use crate::Result;
use bitflags::bitflags;
use cfg_block::cfg_block;
use std::fmt;
use std::fmt::Debug;
use std::mem::ManuallyDrop;
use std::pin::Pin;
use std::sync::Arc;
use std::{
    cell::{Cell, Ref, RefCell, RefMut},
    rc::Rc,
};

/// Advisory lock mode for a numbered byte-range slot (spec.md §4.1/§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Unlock,
    Shared,
    Exclusive,
}

/// A file backing either the database, the WAL, or (single-process mode)
/// the shared-memory region.
pub trait File: Send + Sync {
    /// Non-blocking advisory byte-range lock of the numbered slot. Callers
    /// loop with a short sleep on failure (spec.md §5); this call never
    /// blocks itself.
    fn lock(&self, slot: u32, mode: LockMode) -> Result<bool>;

    /// Non-blocking probe: would `lock(slot, Exclusive)` succeed right now?
    fn test_lock(&self, slot: u32) -> Result<bool>;

    fn pread(&self, pos: u64, c: Arc<Completion>) -> Result<()>;
    fn pwrite(&self, pos: u64, buffer: Arc<RefCell<Buffer>>, c: Arc<Completion>) -> Result<()>;
    fn sync(&self, c: Arc<Completion>) -> Result<()>;
    fn size(&self) -> Result<u64>;
    fn truncate(&self, size: u64) -> Result<()>;

    /// Sector size used to space WAL headers (spec.md §4.3); assumed >= 512.
    fn sector_size(&self) -> usize {
        512
    }

    /// Map (or extend) a 48 KiB shared-memory chunk by index. Returns a raw
    /// pointer valid until `shm_unmap`; callers are responsible for only
    /// touching `SHM_CHUNK_SIZE` bytes from it.
    fn shm_map(&self, chunk: usize) -> Result<*mut u8>;

    /// Memory barrier between writing the two in-memory copies of a
    /// shared-memory structure (spec.md §4.3/§5 "Ordering guarantees").
    fn shm_barrier(&self);

    /// Unmap and, if this was the last reference, delete the backing file.
    fn shm_unmap(&self, delete: bool) -> Result<()>;
}

pub const SHM_CHUNK_SIZE: usize = 48 * 1024;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct OpenFlags(i32);

bitflags! {
    impl OpenFlags: i32 {
        const None = 0b0000;
        const Create = 0b0001;
        const ReadOnly = 0b0010;
        /// Used for the WAL/db file, never buffered by the OS page cache
        /// beyond what `sync()` flushes (spec.md §4.1: "write path must not
        /// buffer").
        const Direct = 0b0100;
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::Create
    }
}

pub trait IO: Send + Sync {
    fn open_file(&self, path: &str, flags: OpenFlags) -> Result<Arc<dyn File>>;

    /// Opens (creating if needed) the shared-memory backing file for
    /// `path` (conventionally `<db>-shm`). In single-process mode this may
    /// be backed by process-heap chunks instead of a real mapped file
    /// (spec.md §5 "Shared-resource policy").
    fn open_shm(&self, path: &str) -> Result<Arc<dyn File>>;

    fn full_path(&self, path: &str) -> Result<String>;

    fn run_once(&self) -> Result<()>;

    fn wait_for_completion(&self, c: Arc<Completion>) -> Result<()> {
        while !c.is_completed() {
            self.run_once()?;
        }
        Ok(())
    }

    fn generate_random_number(&self) -> i64;
}

pub type Complete = dyn Fn(Arc<RefCell<Buffer>>);
pub type WriteComplete = dyn Fn(i32);
pub type SyncComplete = dyn Fn(i32);

pub enum Completion {
    Read(ReadCompletion),
    Write(WriteCompletion),
    Sync(SyncCompletion),
}

pub struct ReadCompletion {
    pub buf: Arc<RefCell<Buffer>>,
    pub complete: Box<Complete>,
    pub is_completed: Cell<bool>,
}

impl Completion {
    pub fn is_completed(&self) -> bool {
        match self {
            Self::Read(r) => r.is_completed.get(),
            Self::Write(w) => w.is_completed.get(),
            Self::Sync(s) => s.is_completed.get(),
        }
    }

    pub fn complete(&self, result: i32) {
        match self {
            Self::Read(r) => r.complete(),
            Self::Write(w) => w.complete(result),
            Self::Sync(s) => s.complete(result),
        }
    }

    /// Only call this if you're sure the completion is a `ReadCompletion`;
    /// panics otherwise.
    pub fn as_read(&self) -> &ReadCompletion {
        match self {
            Self::Read(r) => r,
            _ => unreachable!("not a read completion"),
        }
    }
}

pub struct WriteCompletion {
    pub complete: Box<WriteComplete>,
    pub is_completed: Cell<bool>,
}

pub struct SyncCompletion {
    pub complete: Box<SyncComplete>,
    pub is_completed: Cell<bool>,
}

impl ReadCompletion {
    pub fn new(buf: Arc<RefCell<Buffer>>, complete: Box<Complete>) -> Self {
        Self {
            buf,
            complete,
            is_completed: Cell::new(false),
        }
    }

    pub fn buf(&self) -> Ref<'_, Buffer> {
        self.buf.borrow()
    }

    pub fn buf_mut(&self) -> RefMut<'_, Buffer> {
        self.buf.borrow_mut()
    }

    pub fn complete(&self) {
        (self.complete)(self.buf.clone());
        self.is_completed.set(true);
    }
}

impl WriteCompletion {
    pub fn new(complete: Box<WriteComplete>) -> Self {
        Self {
            complete,
            is_completed: Cell::new(false),
        }
    }

    pub fn complete(&self, bytes_written: i32) {
        (self.complete)(bytes_written);
        self.is_completed.set(true);
    }
}

impl SyncCompletion {
    pub fn new(complete: Box<SyncComplete>) -> Self {
        Self {
            complete,
            is_completed: Cell::new(false),
        }
    }

    pub fn complete(&self, res: i32) {
        (self.complete)(res);
        self.is_completed.set(true);
    }
}

pub type BufferData = Pin<Vec<u8>>;
pub type BufferDropFn = Rc<dyn Fn(BufferData)>;

#[derive(Clone)]
pub struct Buffer {
    data: ManuallyDrop<BufferData>,
    drop: BufferDropFn,
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.data)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let data = unsafe { ManuallyDrop::take(&mut self.data) };
        (self.drop)(data);
    }
}

impl Buffer {
    pub fn allocate(size: usize, drop: BufferDropFn) -> Self {
        let data = ManuallyDrop::new(Pin::new(vec![0; size]));
        Self { data, drop }
    }

    pub fn new(data: BufferData, drop: BufferDropFn) -> Self {
        let data = ManuallyDrop::new(data);
        Self { data, drop }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

pub(crate) fn io_err(kind: IoErrorKind, err: impl std::fmt::Display) -> crate::StorageError {
    crate::StorageError::IoWithMessage(kind, err.to_string())
}

cfg_block! {
    #[cfg(target_family = "unix")] {
        mod unix;
        #[cfg(feature = "fs")]
        pub use unix::UnixIO;
        #[cfg(feature = "fs")]
        pub use unix::UnixIO as PlatformIO;
    }

    #[cfg(not(target_family = "unix"))] {
        // No platform shim is grounded for non-unix targets in this pack;
        // the in-memory backend remains available everywhere.
    }
}

pub mod memory;
pub use memory::MemoryIO;
