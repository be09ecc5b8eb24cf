//! The database file as a flat array of fixed-size pages (spec.md §3
//! "Pages and blocks"). Grounded on
//! `crate::storage::database::DatabaseStorage` referenced from the
//! teacher's `storage/pager.rs` (the trait itself wasn't in the retrieved
//! pack); rebuilt here as the pager's sole point of contact with the
//! database `File` so the pager never computes byte offsets itself.

use crate::io::{Buffer, Completion, File, ReadCompletion, WriteCompletion};
use crate::Result;
use std::cell::RefCell;
use std::sync::Arc;

/// Read/write access to a database file by page number. Implementations
/// must not buffer writes beyond what `sync` flushes (spec.md §4.1).
pub trait DatabaseStorage {
    fn read_page(&self, page_no: u32, page_size: u32, buf: &mut [u8]) -> Result<()>;
    fn write_page(&self, page_no: u32, page_size: u32, buf: &[u8]) -> Result<()>;
    fn size_pages(&self, page_size: u32) -> Result<u32>;
    fn truncate_pages(&self, page_count: u32, page_size: u32) -> Result<()>;
    fn sync(&self) -> Result<()>;
}

pub struct DatabaseFile {
    file: Arc<dyn File>,
}

impl DatabaseFile {
    pub fn new(file: Arc<dyn File>) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &Arc<dyn File> {
        &self.file
    }
}

fn noop_drop() -> crate::io::BufferDropFn {
    std::rc::Rc::new(|_| {})
}

impl DatabaseStorage for DatabaseFile {
    fn read_page(&self, page_no: u32, page_size: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), page_size as usize);
        // Page numbers are 1-based; page 1 starts at byte 0.
        let pos = (page_no as u64 - 1) * page_size as u64;
        let read_buf = Arc::new(RefCell::new(Buffer::allocate(page_size as usize, noop_drop())));
        let target = read_buf.clone();
        let done = Arc::new(Completion::Read(ReadCompletion::new(
            read_buf,
            Box::new(|_| {}),
        )));
        self.file.pread(pos, done.clone())?;
        // Zero-fill on short read (spec.md §4.1) is the File impl's job;
        // by the time pread signals completion the buffer holds either
        // real bytes or zeros.
        buf.copy_from_slice(target.borrow().as_slice());
        Ok(())
    }

    fn write_page(&self, page_no: u32, page_size: u32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), page_size as usize);
        let pos = (page_no as u64 - 1) * page_size as u64;
        let mut owned = Buffer::allocate(page_size as usize, noop_drop());
        owned.as_mut_slice().copy_from_slice(buf);
        let wrapped = Arc::new(RefCell::new(owned));
        let done = Arc::new(Completion::Write(WriteCompletion::new(Box::new(|_| {}))));
        self.file.pwrite(pos, wrapped, done.clone())?;
        Ok(())
    }

    fn size_pages(&self, page_size: u32) -> Result<u32> {
        let bytes = self.file.size()?;
        Ok((bytes / page_size as u64) as u32)
    }

    fn truncate_pages(&self, page_count: u32, page_size: u32) -> Result<()> {
        self.file.truncate(page_count as u64 * page_size as u64)
    }

    fn sync(&self) -> Result<()> {
        let done = Arc::new(Completion::Sync(crate::io::SyncCompletion::new(Box::new(
            |_| {},
        ))));
        self.file.sync(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryIO, OpenFlags, IO};

    #[test]
    fn write_then_read_page() {
        let io = MemoryIO::new();
        let f = io.open_file("db", OpenFlags::Create).unwrap();
        let db = DatabaseFile::new(f);
        let page = vec![7u8; 1024];
        db.write_page(1, 1024, &page).unwrap();
        let mut out = vec![0u8; 1024];
        db.read_page(1, 1024, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn unwritten_page_reads_zero_filled() {
        let io = MemoryIO::new();
        let f = io.open_file("db", OpenFlags::Create).unwrap();
        let db = DatabaseFile::new(f);
        db.write_page(1, 1024, &[1u8; 1024]).unwrap();
        let mut out = vec![0xffu8; 1024];
        db.read_page(2, 1024, &mut out).unwrap();
        assert_eq!(out, vec![0u8; 1024]);
    }
}
