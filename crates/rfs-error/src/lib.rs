#![forbid(unsafe_code)]
//! Error types for RollFS.
//!
//! Defines `RfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings so the mount-time surfaces can report
//! kernel-style integer codes.

use thiserror::Error;

/// Unified error type for all RollFS operations.
#[derive(Debug, Error)]
pub enum RfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid on-disk structure detected while walking the log, e.g. a
    /// looped node chain or a mismatched node offset. Maps to `EINVAL`.
    #[error("corrupt log at block {blkaddr}: {detail}")]
    Corrupt { blkaddr: u32, detail: String },

    /// Metadata that predates the crash is inconsistent. Maps to the
    /// filesystem-corrupted errno (`EUCLEAN`).
    #[error("corrupt metadata: {0}")]
    FsCorrupted(String),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("file exists")]
    Exists,

    #[error("name too long")]
    NameTooLong,

    #[error("read-only filesystem")]
    ReadOnly,

    #[error("quota operation failed: {0}")]
    Quota(String),

    /// A condition the on-disk format and allocator guarantee impossible.
    /// Debug builds assert before constructing this.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl RfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corrupt { .. } | Self::Format(_) => libc::EINVAL,
            Self::FsCorrupted(_) => libc::EUCLEAN,
            Self::OutOfMemory => libc::ENOMEM,
            Self::NotFound(_) => libc::ENOENT,
            Self::NoSpace => libc::ENOSPC,
            Self::Exists => libc::EEXIST,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::ReadOnly => libc::EROFS,
            Self::Quota(_) => libc::EDQUOT,
            Self::Internal(_) => libc::EIO,
        }
    }

    /// True when a bounded backoff-and-retry is the appropriate response.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}

/// Result alias using `RfsError`.
pub type Result<T> = std::result::Result<T, RfsError>;
