use thiserror::Error;

use crate::ids::ItemId;

/// The error taxonomy of spec §7. `cloudsync-fs` maps each variant to a
/// POSIX errno; every other crate returns `CoreError` (or wraps it in
/// `anyhow::Error` for call sites that only propagate, never match).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: ItemId,
        from: String,
        to: String,
    },

    #[error("content hash mismatch for {id}: expected {expected}, got {actual}")]
    HashMismatch {
        id: ItemId,
        expected: String,
        actual: String,
    },

    #[error("etag precondition failed for {0}")]
    ETagConflict(ItemId),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("resource busy: {0}")]
    ResourceBusy(String),

    #[error("local i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("no space: need {needed} bytes, only {available} evictable")]
    NoSpace { needed: u64, available: u64 },

    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl CoreError {
    /// True for kinds the retry machinery should re-drive later, matching
    /// spec §7's `temporary` flag semantics.
    pub fn is_temporary(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::ResourceBusy(_))
    }

    /// Maps a `CoreError` to a POSIX errno, per spec §4.8's failure-mapping
    /// table. Returned as a plain `i32` so a FUSE bridge implementation
    /// (out of scope here) can use it directly without this crate
    /// depending on a specific FUSE binding's error type.
    pub fn to_errno(&self) -> i32 {
        match self {
            CoreError::NotFound(_) => libc::ENOENT,
            CoreError::InvalidTransition { .. } => libc::EINVAL,
            CoreError::InvalidName(_) => libc::EINVAL,
            CoreError::HashMismatch { .. } => libc::EIO,
            CoreError::ETagConflict(_) => libc::EEXIST,
            CoreError::Transient(_) => libc::EIO,
            CoreError::Permanent(_) => libc::EIO,
            CoreError::ResourceBusy(_) => libc::EAGAIN,
            CoreError::Io(_) => libc::EIO,
            CoreError::Cancelled => libc::ECANCELED,
            CoreError::NoSpace { .. } => libc::ENOSPC,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
