//! Core VFS types.
//!
//! Shared by every backend and by the dispatch layer. Attribute types
//! serialize so the CLI can dump them as JSON.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

/// File attributes (metadata).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Unix permissions (e.g., 0o644).
    pub perm: u32,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last access time (optional).
    pub atime: Option<SystemTime>,
    /// Number of hard links.
    pub nlink: u32,
}

impl FileAttr {
    /// Attributes for a regular file.
    pub fn file(size: u64, perm: u32) -> Self {
        Self {
            size,
            kind: FileType::File,
            perm,
            mtime: SystemTime::now(),
            atime: None,
            nlink: 1,
        }
    }

    /// Attributes for a directory.
    pub fn directory(perm: u32) -> Self {
        Self {
            size: 0,
            kind: FileType::Directory,
            perm,
            mtime: SystemTime::now(),
            atime: None,
            nlink: 2, // . and ..
        }
    }

    /// Replace the modification time.
    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = mtime;
        self
    }

    /// Replace the modification time from seconds since the epoch.
    pub fn with_mtime_secs(self, secs: i64) -> Self {
        let mtime = if secs >= 0 {
            UNIX_EPOCH + Duration::from_secs(secs as u64)
        } else {
            UNIX_EPOCH
        };
        self.with_mtime(mtime)
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

/// Open file flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Read and write an existing file (`r+`).
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Write-only, truncating (`w`).
    pub fn write_truncate() -> Self {
        Self {
            read: false,
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// Write-only, appending (`a`).
    pub fn append() -> Self {
        Self {
            read: false,
            write: true,
            create: true,
            append: true,
            ..Default::default()
        }
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            exclusive: true,
            ..Default::default()
        }
    }

    /// Whether the mode intends to modify the file.
    pub fn wants_write(&self) -> bool {
        self.write
    }
}

/// Access check requested by `access`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessMode {
    /// Read permission.
    pub read: bool,
    /// Write permission.
    pub write: bool,
    /// Execute/search permission.
    pub execute: bool,
}

impl AccessMode {
    /// Existence only.
    pub const EXISTS: AccessMode = AccessMode {
        read: false,
        write: false,
        execute: false,
    };

    /// Read permission.
    pub const READ: AccessMode = AccessMode {
        read: true,
        write: false,
        execute: false,
    };

    /// Write permission.
    pub const WRITE: AccessMode = AccessMode {
        read: false,
        write: true,
        execute: false,
    };

    /// Execute permission.
    pub const EXECUTE: AccessMode = AccessMode {
        read: false,
        write: false,
        execute: true,
    };
}

/// Which kinds of entry a directory match should report.
///
/// `mounts` is a distinct enumeration mode: backends list their own mount
/// points one level below the directory and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobTypes {
    /// Report directories.
    pub dirs: bool,
    /// Report regular files.
    pub files: bool,
    /// Report mount points instead of entries.
    pub mounts: bool,
}

impl Default for GlobTypes {
    fn default() -> Self {
        Self::ANY
    }
}

impl GlobTypes {
    /// Files and directories.
    pub const ANY: GlobTypes = GlobTypes {
        dirs: true,
        files: true,
        mounts: false,
    };

    /// Directories only.
    pub const DIRS: GlobTypes = GlobTypes {
        dirs: true,
        files: false,
        mounts: false,
    };

    /// Regular files only.
    pub const FILES: GlobTypes = GlobTypes {
        dirs: false,
        files: true,
        mounts: false,
    };

    /// Mount-point enumeration.
    pub const MOUNTS: GlobTypes = GlobTypes {
        dirs: false,
        files: false,
        mounts: true,
    };

    /// Whether an entry of the given kind is wanted.
    pub fn accepts(&self, is_dir: bool) -> bool {
        if is_dir { self.dirs } else { self.files }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type() {
        assert!(FileType::File.is_file());
        assert!(!FileType::File.is_dir());
        assert!(FileType::Directory.is_dir());
        assert!(FileType::Symlink.is_symlink());
    }

    #[test]
    fn test_file_attr_constructors() {
        let file = FileAttr::file(1024, 0o555);
        assert!(file.is_file());
        assert_eq!(file.size, 1024);
        assert_eq!(file.perm, 0o555);

        let dir = FileAttr::directory(0o555).with_mtime_secs(60);
        assert!(dir.is_dir());
        assert_eq!(dir.nlink, 2);
        assert_eq!(dir.mtime, UNIX_EPOCH + Duration::from_secs(60));
    }

    #[test]
    fn test_open_flags() {
        let read = OpenFlags::read();
        assert!(read.read);
        assert!(!read.wants_write());

        let append = OpenFlags::append();
        assert!(append.append);
        assert!(append.wants_write());
        assert!(!append.read);
    }

    #[test]
    fn test_glob_types_accepts() {
        assert!(GlobTypes::ANY.accepts(true));
        assert!(GlobTypes::ANY.accepts(false));
        assert!(!GlobTypes::DIRS.accepts(false));
        assert!(!GlobTypes::MOUNTS.accepts(true));
    }
}
