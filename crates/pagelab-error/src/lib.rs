#![forbid(unsafe_code)]
//! Error types for pagelab.
//!
//! Defines `PagelabError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for the fd-style handle facade.

use thiserror::Error;

/// Unified error type for all pagelab operations.
#[derive(Debug, Error)]
pub enum PagelabError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad handle")]
    BadHandle,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("too many open files")]
    TooManyOpenFiles,

    #[error("out of memory")]
    OutOfMemory,
}

impl PagelabError {
    /// Convert this error into a POSIX errno suitable for fd-style callers.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::BadHandle => libc::EBADF,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::TooManyOpenFiles => libc::EMFILE,
            Self::OutOfMemory => libc::ENOMEM,
        }
    }
}

impl From<std::collections::TryReserveError> for PagelabError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result alias using `PagelabError`.
pub type Result<T> = std::result::Result<T, PagelabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(PagelabError::BadHandle.to_errno(), libc::EBADF);
        assert_eq!(
            PagelabError::InvalidArgument("x".to_owned()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(PagelabError::TooManyOpenFiles.to_errno(), libc::EMFILE);
        assert_eq!(PagelabError::OutOfMemory.to_errno(), libc::ENOMEM);
    }

    #[test]
    fn io_errno_passthrough() {
        let err = PagelabError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_errno(), libc::ENOSPC);

        let err = PagelabError::Io(std::io::Error::other("no raw errno"));
        assert_eq!(err.to_errno(), libc::EIO);
    }
}
