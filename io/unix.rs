//! Unix platform I/O shim. Grounded on the teacher's `cfg_block!` platform
//! dispatch (`io/mod.rs`) which names a `UnixIO`/`PlatformIO` here but
//! keeps its body out of the retrieved pack; rebuilt from spec.md §4.1
//! using `rustix` for file ops and `mmap`, and raw `libc::fcntl` for
//! byte-range advisory locks (rustix has no stable `F_SETLK` wrapper).

use super::{io_err, Completion, File, LockMode, OpenFlags, IO, SHM_CHUNK_SIZE};
use crate::error::IoErrorKind;
use crate::Result;
use parking_lot::Mutex;
use rustix::fd::AsFd;
use rustix::fs::{Mode, OFlags};
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

pub struct UnixIO;

impl UnixIO {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }
}

impl IO for UnixIO {
    fn open_file(&self, path: &str, flags: OpenFlags) -> Result<Arc<dyn File>> {
        let mut oflags = OFlags::RDWR;
        if flags.contains(OpenFlags::Create) {
            oflags |= OFlags::CREATE;
        }
        if flags.contains(OpenFlags::ReadOnly) {
            oflags = OFlags::RDONLY;
        }
        let fd = rustix::fs::open(path, oflags, Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP)
            .map_err(|e| io_err(IoErrorKind::Read, e))?;
        Ok(Arc::new(UnixFile {
            file: std::fs::File::from(fd),
            locks: Mutex::new(HashMap::new()),
        }))
    }

    fn open_shm(&self, path: &str) -> Result<Arc<dyn File>> {
        // Same backing mechanism as a regular file; callers mmap 48 KiB
        // chunks of it via `File::shm_map` (spec.md §6 "Shared-memory layout").
        self.open_file(path, OpenFlags::Create)
    }

    fn full_path(&self, path: &str) -> Result<String> {
        let canon = std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path));
        Ok(canon.to_string_lossy().into_owned())
    }

    fn run_once(&self) -> Result<()> {
        // This shim performs I/O synchronously inside pread/pwrite/sync;
        // there is nothing to pump. A `polling`-backed async variant would
        // plug in here without changing the `File`/`IO` trait surface.
        Ok(())
    }

    fn generate_random_number(&self) -> i64 {
        let mut buf = [0u8; 8];
        getrandom::getrandom(&mut buf).expect("getrandom failed");
        i64::from_ne_bytes(buf)
    }
}

struct UnixFile {
    file: std::fs::File,
    /// mmap'd shared-memory chunks, keyed by chunk index (spec.md §4.1
    /// "shared-memory region mapping in 48 KiB chunks").
    locks: Mutex<HashMap<usize, ShmChunk>>,
}

struct ShmChunk {
    ptr: *mut u8,
    len: usize,
}
unsafe impl Send for ShmChunk {}

impl File for UnixFile {
    fn lock(&self, slot: u32, mode: LockMode) -> Result<bool> {
        let fd: RawFd = self.file.as_raw_fd();
        let (l_type, l_len): (i16, i64) = match mode {
            LockMode::Unlock => (libc::F_UNLCK as i16, 1),
            LockMode::Shared => (libc::F_RDLCK as i16, 1),
            LockMode::Exclusive => (libc::F_WRLCK as i16, 1),
        };
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = l_type;
        fl.l_whence = libc::SEEK_SET as i16;
        fl.l_start = slot as i64;
        fl.l_len = l_len;
        let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
        if rc == 0 {
            Ok(true)
        } else {
            let errno = std::io::Error::last_os_error();
            match errno.raw_os_error() {
                Some(libc::EACCES) | Some(libc::EAGAIN) => Ok(false),
                _ => Err(io_err(IoErrorKind::Lock, errno)),
            }
        }
    }

    fn test_lock(&self, slot: u32) -> Result<bool> {
        let fd: RawFd = self.file.as_raw_fd();
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_WRLCK as i16;
        fl.l_whence = libc::SEEK_SET as i16;
        fl.l_start = slot as i64;
        fl.l_len = 1;
        let rc = unsafe { libc::fcntl(fd, libc::F_GETLK, &mut fl) };
        if rc != 0 {
            return Err(io_err(IoErrorKind::Lock, std::io::Error::last_os_error()));
        }
        Ok(fl.l_type as i32 == libc::F_UNLCK)
    }

    fn pread(&self, pos: u64, c: Arc<Completion>) -> Result<()> {
        use std::os::unix::fs::FileExt;
        let r = c.as_read();
        let mut buf = r.buf_mut();
        let slice = buf.as_mut_slice();
        let read = match self.file.read_at(slice, pos) {
            Ok(n) => n,
            Err(e) => return Err(io_err(IoErrorKind::Read, e)),
        };
        // Zero-fill on short read (spec.md §4.1).
        if read < slice.len() {
            slice[read..].fill(0);
        }
        drop(buf);
        c.complete(read as i32);
        Ok(())
    }

    fn pwrite(
        &self,
        pos: u64,
        buffer: Arc<RefCell<super::Buffer>>,
        c: Arc<Completion>,
    ) -> Result<()> {
        use std::os::unix::fs::FileExt;
        let buf = buffer.borrow();
        let slice = buf.as_slice();
        let written = match self.file.write_at(slice, pos) {
            Ok(n) => n,
            Err(e) => return Err(io_err(IoErrorKind::Write, e)),
        };
        drop(buf);
        c.complete(written as i32);
        Ok(())
    }

    fn sync(&self, c: Arc<Completion>) -> Result<()> {
        self.file.sync_all().map_err(|e| io_err(IoErrorKind::Fsync, e))?;
        c.complete(0);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| io_err(IoErrorKind::Fstat, e))
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .map_err(|e| io_err(IoErrorKind::Truncate, e))
    }

    fn sector_size(&self) -> usize {
        512
    }

    fn shm_map(&self, chunk: usize) -> Result<*mut u8> {
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(&chunk) {
            return Ok(existing.ptr);
        }
        let offset = (chunk * SHM_CHUNK_SIZE) as u64;
        let needed = offset + SHM_CHUNK_SIZE as u64;
        if self.size()? < needed {
            self.truncate(needed)?;
        }
        let fd = self.file.as_fd();
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                SHM_CHUNK_SIZE,
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::SHARED,
                fd,
                offset,
            )
            .map_err(|e| io_err(IoErrorKind::ShmMap, e))?
        } as *mut u8;
        locks.insert(
            chunk,
            ShmChunk {
                ptr,
                len: SHM_CHUNK_SIZE,
            },
        );
        Ok(ptr)
    }

    fn shm_barrier(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    fn shm_unmap(&self, delete: bool) -> Result<()> {
        let mut locks = self.locks.lock();
        for (_, chunk) in locks.drain() {
            unsafe {
                let _ = rustix::mm::munmap(chunk.ptr as *mut core::ffi::c_void, chunk.len);
            }
        }
        if delete {
            // Caller is expected to have the canonical path; deletion of
            // the backing `-shm` file itself is done by the lock manager
            // at disconnect, not here, since this `File` only knows its fd.
        }
        Ok(())
    }
}
