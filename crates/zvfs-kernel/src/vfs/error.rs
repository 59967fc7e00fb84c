//! VFS error types.

use std::io;
use thiserror::Error;

use super::backends::zip::ZipError;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File or directory not found, or no backend claims the path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid argument (EINVAL).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The owning backend does not implement this operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Something still holds the resource open.
    #[error("filesystem is busy")]
    Busy,

    /// The backend cannot do this in place; copy through the native
    /// filesystem instead (EXDEV).
    #[error("cross-device link")]
    CrossDevice,

    /// Write would grow a file beyond the configured maximum (EFBIG).
    #[error("file too large: {0}")]
    FileTooLarge(String),

    /// The backend or registry refuses to remove something it depends on.
    #[error("cannot unregister the default filesystem")]
    DefaultFilesystem,

    /// Structural ZIP archive error.
    #[error(transparent)]
    Zip(#[from] ZipError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a FileTooLarge error.
    pub fn file_too_large(path: impl Into<String>) -> Self {
        Self::FileTooLarge(path.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Returns true for the "backend lacks this capability" case.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, VfsError::Unsupported(_))
    }

    /// Returns true when the path simply isn't there.
    pub fn is_not_found(&self) -> bool {
        match self {
            VfsError::NotFound(_) => true,
            VfsError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            VfsError::InvalidPath(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::InvalidArgument(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::Unsupported(op) => io::Error::new(io::ErrorKind::Unsupported, op),
            VfsError::Busy => io::Error::new(io::ErrorKind::ResourceBusy, "filesystem is busy"),
            VfsError::CrossDevice => io::Error::new(io::ErrorKind::CrossesDevices, "cross-device link"),
            VfsError::FileTooLarge(msg) => io::Error::new(io::ErrorKind::FileTooLarge, msg),
            VfsError::DefaultFilesystem => {
                io::Error::new(io::ErrorKind::PermissionDenied, "cannot unregister the default filesystem")
            }
            VfsError::Zip(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            VfsError::Io(e) => e,
            VfsError::Other(msg) => io::Error::other(msg),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kind_mapping() {
        let e: io::Error = VfsError::not_found("/nope").into();
        assert_eq!(e.kind(), io::ErrorKind::NotFound);

        let e: io::Error = VfsError::Busy.into();
        assert_eq!(e.kind(), io::ErrorKind::ResourceBusy);
        assert_eq!(e.to_string(), "filesystem is busy");

        let e: io::Error = VfsError::Unsupported("utime").into();
        assert_eq!(e.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_not_found_through_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(VfsError::from(io_err).is_not_found());
        assert!(!VfsError::Busy.is_not_found());
    }
}
