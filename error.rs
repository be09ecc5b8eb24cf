use thiserror::Error;

/// The sub-classes of I/O failure the OS shim can report, per spec.md §6/§7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorKind {
    Fsync,
    Read,
    Write,
    Lock,
    ShmMap,
    Fstat,
    Truncate,
    DirFsync,
}

impl std::fmt::Display for IoErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IoErrorKind::Fsync => "fsync",
            IoErrorKind::Read => "read",
            IoErrorKind::Write => "write",
            IoErrorKind::Lock => "lock",
            IoErrorKind::ShmMap => "shmmap",
            IoErrorKind::Fstat => "fstat",
            IoErrorKind::Truncate => "truncate",
            IoErrorKind::DirFsync => "dir_fsync",
        };
        f.write_str(s)
    }
}

/// The closed error taxonomy of spec.md §7.
///
/// `NotFound`/`Inexact`/`BlockFull` are internal-only: the B-tree, pager
/// and FI-tree use them as control-flow signals between themselves and
/// never let them cross the public cursor API (see `types::CursorResult`
/// and `types::SeekResult`).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database is locked")]
    Busy,

    #[error("out of memory")]
    NoMem,

    #[error("database or disk is full")]
    Full,

    #[error("disk I/O error: {0}")]
    Io(IoErrorKind),

    #[error("disk I/O error ({0}): {1}")]
    IoWithMessage(IoErrorKind, String),

    #[error("database disk image is malformed: {0}")]
    Corrupt(String),

    #[error("file is not a database")]
    NotADb,

    #[error("locking protocol violation")]
    Protocol,

    #[error("internal error: {0}")]
    InternalError(String),

    /// Internal-only: requested key is not present.
    #[error("key not found")]
    NotFound,

    /// Internal-only: a seek landed on a neighboring key, not an exact match.
    #[error("seek landed off-key")]
    Inexact,

    /// Internal-only: the current fast-insert sub-block is full.
    #[error("fast-insert block is full")]
    BlockFull,
}

impl StorageError {
    pub fn is_internal_only(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound | StorageError::Inexact | StorageError::BlockFull
        )
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
