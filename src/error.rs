//! Kernel error type.
//!
//! User-invoked operations surface failures as `KernelError`; the syscall
//! layer folds them into the -1 / `false` convention of the call surface.
//! Fatal conditions (device I/O failure, invariant violations) panic instead.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, KernelError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file or directory already exists")]
    AlreadyExists,
    #[error("out of free sectors")]
    NoSpace,
    #[error("invalid path")]
    InvalidPath,
    #[error("name too long")]
    NameTooLong,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("resource is in use")]
    InUse,
    #[error("bad file descriptor")]
    BadFd,
    #[error("mapping failed")]
    MapFailed,
    #[error("write denied")]
    WriteDenied,
    #[error("filesystem corrupted: {0}")]
    Corrupted(&'static str),
}
