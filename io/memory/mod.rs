//! In-memory `IO` backend used by tests. Adapted from the teacher's
//! `io/memory/mod.rs` (page-indexed `BTreeMap`, `PAGE_SIZE` constant), but
//! files are looked up from a process-wide registry keyed by path rather
//! than allocated fresh per `open_file` call, so that two `MemoryIO`
//! handles opening the same path (simulating two connections in a
//! multi-process test, spec.md §8 "two-connection snapshot isolation",
//! "reader-slot reuse across 5 readers") observe the same bytes, locks
//! and shared-memory region.

use super::{io_err, Buffer, BufferDropFn, Completion, File, LockMode, OpenFlags, IO, SHM_CHUNK_SIZE};
use crate::error::IoErrorKind;
use crate::Result;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

const PAGE_SIZE: usize = 4096;
type MemPage = Box<[u8; PAGE_SIZE]>;

#[derive(Default)]
struct Registry {
    files: HashMap<String, Arc<MemoryFileShared>>,
}

/// Shared, process-wide table of in-memory "files" by path. A fresh
/// registry gives test isolation; `clone_handle` shares the registry to
/// model several connections against one database.
#[derive(Clone)]
pub struct MemoryIO {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryIO {
    pub fn new() -> Self {
        debug!(backend = "memory", "opening IO backend");
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// A second handle onto the same in-memory files, modeling a second
    /// connection in the same process (spec.md §5 "single-process mode").
    pub fn clone_handle(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl Default for MemoryIO {
    fn default() -> Self {
        Self::new()
    }
}

impl IO for MemoryIO {
    fn open_file(&self, path: &str, _flags: OpenFlags) -> Result<Arc<dyn File>> {
        let mut reg = self.registry.lock();
        let shared = reg
            .files
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(MemoryFileShared::new()))
            .clone();
        Ok(Arc::new(MemoryFile { shared }))
    }

    fn open_shm(&self, path: &str) -> Result<Arc<dyn File>> {
        self.open_file(path, OpenFlags::Create)
    }

    fn full_path(&self, path: &str) -> Result<String> {
        Ok(path.to_string())
    }

    fn run_once(&self) -> Result<()> {
        Ok(())
    }

    fn generate_random_number(&self) -> i64 {
        let mut buf = [0u8; 8];
        getrandom::getrandom(&mut buf).expect("getrandom failed");
        i64::from_ne_bytes(buf)
    }
}

struct MemoryFileShared {
    pages: Mutex<BTreeMap<usize, MemPage>>,
    size: Mutex<usize>,
    locks: Mutex<HashMap<u32, LockMode>>,
    shm: Mutex<HashMap<usize, Box<[u8; SHM_CHUNK_SIZE]>>>,
}

impl MemoryFileShared {
    fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
            size: Mutex::new(0),
            locks: Mutex::new(HashMap::new()),
            shm: Mutex::new(HashMap::new()),
        }
    }
}

pub struct MemoryFile {
    shared: Arc<MemoryFileShared>,
}
unsafe impl Send for MemoryFile {}
unsafe impl Sync for MemoryFile {}

impl File for MemoryFile {
    fn lock(&self, slot: u32, mode: LockMode) -> Result<bool> {
        let mut locks = self.shared.locks.lock();
        match mode {
            LockMode::Unlock => {
                locks.remove(&slot);
                Ok(true)
            }
            LockMode::Shared => match locks.get(&slot) {
                Some(LockMode::Exclusive) => Ok(false),
                _ => {
                    locks.insert(slot, LockMode::Shared);
                    Ok(true)
                }
            },
            LockMode::Exclusive => match locks.get(&slot) {
                None => {
                    locks.insert(slot, LockMode::Exclusive);
                    Ok(true)
                }
                Some(_) => Ok(false),
            },
        }
    }

    fn test_lock(&self, slot: u32) -> Result<bool> {
        let locks = self.shared.locks.lock();
        Ok(!locks.contains_key(&slot))
    }

    fn pread(&self, pos: u64, c: Arc<Completion>) -> Result<()> {
        let r = c.as_read();
        let file_size = *self.shared.size.lock();
        let pos = pos as usize;
        let mut buf = r.buf_mut();
        let buf_len = buf.len();
        if buf_len == 0 || pos >= file_size {
            drop(buf);
            c.complete(0);
            return Ok(());
        }
        let read_len = buf_len.min(file_size - pos);
        {
            let slice = buf.as_mut_slice();
            let pages = self.shared.pages.lock();
            let mut offset = pos;
            let mut remaining = read_len;
            let mut out = 0;
            while remaining > 0 {
                let page_no = offset / PAGE_SIZE;
                let page_offset = offset % PAGE_SIZE;
                let n = remaining.min(PAGE_SIZE - page_offset);
                match pages.get(&page_no) {
                    Some(p) => {
                        slice[out..out + n].copy_from_slice(&p[page_offset..page_offset + n])
                    }
                    None => slice[out..out + n].fill(0),
                }
                offset += n;
                out += n;
                remaining -= n;
            }
            if read_len < slice.len() {
                slice[read_len..].fill(0);
            }
        }
        drop(buf);
        c.complete(read_len as i32);
        Ok(())
    }

    fn pwrite(
        &self,
        pos: u64,
        buffer: Arc<RefCell<Buffer>>,
        c: Arc<Completion>,
    ) -> Result<()> {
        let buf = buffer.borrow();
        let data = buf.as_slice();
        let buf_len = data.len();
        let pos = pos as usize;
        if buf_len > 0 {
            let mut pages = self.shared.pages.lock();
            let mut offset = pos;
            let mut remaining = buf_len;
            let mut src = 0;
            while remaining > 0 {
                let page_no = offset / PAGE_SIZE;
                let page_offset = offset % PAGE_SIZE;
                let n = remaining.min(PAGE_SIZE - page_offset);
                let page = pages
                    .entry(page_no)
                    .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
                page[page_offset..page_offset + n].copy_from_slice(&data[src..src + n]);
                offset += n;
                src += n;
                remaining -= n;
            }
            let mut size = self.shared.size.lock();
            *size = (*size).max(pos + buf_len);
        }
        drop(buf);
        c.complete(buf_len as i32);
        Ok(())
    }

    fn sync(&self, c: Arc<Completion>) -> Result<()> {
        c.complete(0);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(*self.shared.size.lock() as u64)
    }

    fn truncate(&self, size: u64) -> Result<()> {
        let size = size as usize;
        *self.shared.size.lock() = size;
        self.shared
            .pages
            .lock()
            .retain(|&page_no, _| page_no * PAGE_SIZE < size);
        Ok(())
    }

    fn shm_map(&self, chunk: usize) -> Result<*mut u8> {
        let mut shm = self.shared.shm.lock();
        let entry = shm
            .entry(chunk)
            .or_insert_with(|| Box::new([0u8; SHM_CHUNK_SIZE]));
        Ok(entry.as_mut_ptr())
    }

    fn shm_barrier(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    fn shm_unmap(&self, delete: bool) -> Result<()> {
        if delete {
            self.shared.shm.lock().clear();
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn fake_io_error(kind: IoErrorKind) -> crate::StorageError {
    io_err(kind, "simulated failure")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{OpenFlags, ReadCompletion, WriteCompletion, IO};

    fn noop_drop() -> BufferDropFn {
        std::rc::Rc::new(|_| {})
    }

    #[test]
    fn read_after_write_roundtrips() {
        let io = MemoryIO::new();
        let f = io.open_file("db", OpenFlags::Create).unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let buf = Arc::new(RefCell::new(Buffer::new(
            std::pin::Pin::new(data.clone()),
            noop_drop(),
        )));
        let done = Arc::new(Completion::Write(WriteCompletion::new(Box::new(|_| {}))));
        f.pwrite(0, buf, done.clone()).unwrap();
        assert!(done.is_completed());

        let read_buf = Arc::new(RefCell::new(Buffer::allocate(4096, noop_drop())));
        let read_done = Arc::new(Completion::Read(ReadCompletion::new(
            read_buf.clone(),
            Box::new(|_| {}),
        )));
        f.pread(0, read_done.clone()).unwrap();
        assert!(read_done.is_completed());
        assert_eq!(read_buf.borrow().as_slice(), &data[..]);
    }

    #[test]
    fn two_handles_share_locks() {
        let io1 = MemoryIO::new();
        let io2 = io1.clone_handle();
        let f1 = io1.open_file("db", OpenFlags::Create).unwrap();
        let f2 = io2.open_file("db", OpenFlags::Create).unwrap();
        assert!(f1.lock(3, LockMode::Exclusive).unwrap());
        assert!(!f2.lock(3, LockMode::Exclusive).unwrap());
        assert!(f1.lock(3, LockMode::Unlock).unwrap());
        assert!(f2.lock(3, LockMode::Exclusive).unwrap());
    }

    #[test]
    fn shm_map_shared_between_handles() {
        let io1 = MemoryIO::new();
        let io2 = io1.clone_handle();
        let f1 = io1.open_shm("db-shm").unwrap();
        let f2 = io2.open_shm("db-shm").unwrap();
        let p1 = f1.shm_map(0).unwrap();
        unsafe {
            *p1 = 42;
        }
        let p2 = f2.shm_map(0).unwrap();
        unsafe {
            assert_eq!(*p2, 42);
        }
    }
}
