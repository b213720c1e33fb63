//! Error taxonomy and its mapping onto kernel errno codes.

use std::fmt;

use crate::object_client::ObjectError;

/// Internal error currency used by every module between the dispatcher
/// and the object client, mapped onto kernel errno codes at the dispatcher boundary.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("non-sequential write outside buffered region")]
    NonSequentialWrite,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("upload aborted: {0}")]
    UploadAborted(String),
    #[error("cache full")]
    CacheFull,
    #[error("interrupted")]
    Interrupted,
    #[error("directory not empty")]
    NotEmpty,
    #[error("operation not supported")]
    NotSupported,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("corrupt listing: {0}")]
    CorruptListing(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store error: {0}")]
    Object(#[from] ObjectError),
}

impl FsError {
    /// Maps this error to the `libc` errno the kernel reply carries.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NonSequentialWrite => libc::EIO,
            FsError::PreconditionFailed => libc::EIO,
            FsError::UploadAborted(_) => libc::EIO,
            FsError::CacheFull => libc::ENOSPC,
            FsError::Interrupted => libc::EINTR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotSupported => libc::EOPNOTSUPP,
            FsError::ReadOnly => libc::EROFS,
            FsError::BadFileDescriptor => libc::EBADF,
            FsError::CorruptListing(_) => libc::EIO,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::Io(_) => libc::EIO,
            FsError::Object(e) => e.errno(),
        }
    }
}

/// Newtype so `Display` doesn't leak through to kernel-facing logs by
/// accident; callers format with `{:#}` when they want the errno.
pub struct Errno(pub libc::c_int);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

pub type FsResult<T> = Result<T, FsError>;
