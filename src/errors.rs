//! The crate-wide error type.
//!
//! Storage backends, the lock system, the dead-property stores and all
//! middlewares speak the same error vocabulary so that callers can map an
//! error kind straight onto a protocol status without inspecting backend
//! internals. Provider-specific detail travels inside the [`FsError::Io`]
//! variant.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type used by all filesystem, lock and property operations.
pub type FsResult<T> = Result<T, FsError>;

/// Errors returned by filesystems, lock systems and middlewares.
///
/// The type is `Clone` on purpose: results are fanned out to multiple
/// waiters by the cache middleware's single-flight groups.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Exists,
    #[error("is a directory")]
    IsDirectory,
    #[error("not a directory")]
    NotDirectory,
    #[error("permission denied")]
    Forbidden,
    #[error("locked")]
    Locked,
    #[error("no such lock")]
    NoSuchLock,
    #[error("cancelled")]
    Cancelled,
    #[error("timeout")]
    Timeout,
    #[error("not implemented")]
    NotImplemented,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl FsError {
    /// Wrap an arbitrary error as an I/O failure, keeping its message.
    pub fn other<E>(err: E) -> FsError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        FsError::Io(Arc::new(io::Error::other(err)))
    }
}

impl PartialEq for FsError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FsError::InvalidArgument(a), FsError::InvalidArgument(b)) => a == b,
            (FsError::Io(a), FsError::Io(b)) => a.kind() == b.kind(),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl Eq for FsError {}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound,
            io::ErrorKind::AlreadyExists => FsError::Exists,
            io::ErrorKind::PermissionDenied => FsError::Forbidden,
            io::ErrorKind::TimedOut => FsError::Timeout,
            _ => FsError::Io(Arc::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let err: FsError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err, FsError::NotFound);
        let err: FsError = io::Error::new(io::ErrorKind::AlreadyExists, "there").into();
        assert_eq!(err, FsError::Exists);
        let err: FsError = io::Error::other("boom").into();
        assert!(matches!(err, FsError::Io(_)));
    }
}
