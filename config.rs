//! Per-connection pager configuration, per spec.md §6.
//!
//! Re-expressed from the teacher's PRAGMA handling (`translate/pragma.rs`:
//! `cache_size`, `journal_mode`, `wal_checkpoint`) as a plain builder,
//! since PRAGMA/SQL parsing is out of scope for this core.

/// fsync discipline, per spec.md §4.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Never fsync; fastest, least durable.
    Off,
    /// fsync the WAL before publishing a commit, but not the database
    /// file on every checkpoint.
    Normal,
    /// fsync both the WAL (padded to the sector) and the database file.
    Full,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Normal
    }
}

pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 32768;
pub const DEFAULT_PAGE_SIZE: u32 = 1024;
pub const DEFAULT_BLOCK_SIZE: u32 = 512 * 1024;
pub const DEFAULT_AUTO_CHECKPOINT_FRAMES: u32 = 1000;
/// Default minimum run of consecutive levels at an age before a merge is
/// scheduled (spec.md §4.6 `nMinMerge`).
pub const DEFAULT_MIN_MERGE: u32 = 2;
/// spec.md §8: region (c) must exceed this many frames to justify a wrap.
pub const BT_NWRAPLOG: u64 = 100;

#[derive(Clone, Debug)]
pub struct PagerConfig {
    pub page_size: u32,
    pub block_size: u32,
    pub safety: SyncMode,
    /// 0 disables auto-checkpoint.
    pub auto_checkpoint_frames: u32,
    /// Whether this database file may be shared by more than one OS
    /// process at once. When set, the WAL re-syncs its in-memory frame
    /// index against the on-disk log at snapshot and checkpoint
    /// boundaries instead of trusting the index built at open (spec.md
    /// §4.3 "hash-index in shared memory").
    pub multi_proc: bool,
    pub min_merge: u32,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            safety: SyncMode::default(),
            auto_checkpoint_frames: DEFAULT_AUTO_CHECKPOINT_FRAMES,
            multi_proc: false,
            min_merge: DEFAULT_MIN_MERGE,
        }
    }
}

impl PagerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(crate::StorageError::InternalError(format!(
                "page size {} must be a power of two in [{}, {}]",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.block_size < self.page_size || self.block_size % self.page_size != 0 {
            return Err(crate::StorageError::InternalError(format!(
                "block size {} must be a multiple of page size {}",
                self.block_size, self.page_size
            )));
        }
        Ok(())
    }

    pub fn pages_per_block(&self) -> u32 {
        self.block_size / self.page_size
    }
}

/// Invoked after each commit with the new WAL frame count (spec.md §6).
pub type LogSizeCallback = Box<dyn Fn(u64) + Send + Sync>;
