//! Filesystem capability trait.
//!
//! One trait method per capability. A backend only has to say which paths
//! it owns; everything else defaults to `VfsError::Unsupported` so the
//! dispatcher can fall back or report the gap. Paths handed to backends are
//! already tilde-expanded and normalized.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use super::VfsResult;
use super::error::VfsError;
use super::registry::EpochCounter;
use super::types::{AccessMode, FileAttr, GlobTypes, OpenFlags};
use crate::chan::Channel;

/// Backend-specific cached form of a path (a `PathBuf` for native files).
pub type NativeRep = Arc<dyn Any + Send + Sync>;

/// How a loadable file can be handed to the platform loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTarget {
    /// File the loader should open.
    pub path: PathBuf,
    /// True when `path` is a temporary copy the caller should delete.
    pub temporary: bool,
}

/// Filesystem capability table.
pub trait Filesystem: Send + Sync + 'static {
    // ========================================================================
    // Ownership
    // ========================================================================

    /// Whether this backend owns `path`.
    fn path_in_filesystem(&self, path: &str) -> bool;

    /// Called once when the backend is added to a registry. Backends that
    /// change their own path space (mount/unmount) keep the counter and bump
    /// it.
    fn registered(&self, _epoch: EpochCounter) {}

    /// Volume roots this backend provides.
    fn list_volumes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Path separator.
    fn separator(&self, _path: &str) -> char {
        '/'
    }

    /// Short type tag for a path ("native", "zip", ...).
    fn path_type(&self, _path: &str) -> VfsResult<String> {
        Err(VfsError::Unsupported("path_type"))
    }

    // ========================================================================
    // Path representation
    // ========================================================================

    /// Rewrite `path` from byte offset `checkpoint` onward into canonical
    /// form, returning the new checkpoint. Returns `checkpoint` unchanged
    /// when the backend has nothing to add.
    fn normalize_path(&self, _path: &mut String, checkpoint: usize) -> usize {
        checkpoint
    }

    /// Build the backend's cached representation of a normalized path.
    fn create_native_rep(&self, _path: &str) -> Option<NativeRep> {
        None
    }

    /// Turn a native representation back into a normalized path string.
    fn internal_to_normalized(&self, _rep: &NativeRep) -> Option<String> {
        None
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// File attributes, following links.
    fn stat(&self, _path: &str) -> VfsResult<FileAttr> {
        Err(VfsError::Unsupported("stat"))
    }

    /// File attributes, not following links.
    fn lstat(&self, path: &str) -> VfsResult<FileAttr> {
        self.stat(path)
    }

    /// Check access permissions. `AccessMode::EXISTS` checks existence.
    fn access(&self, _path: &str, _mode: AccessMode) -> VfsResult<()> {
        Err(VfsError::Unsupported("access"))
    }

    /// Set access and modification times.
    fn utime(&self, _path: &str, _atime: SystemTime, _mtime: SystemTime) -> VfsResult<()> {
        Err(VfsError::Unsupported("utime"))
    }

    /// Names of the backend's extra attributes.
    fn file_attr_strings(&self, _path: &str) -> VfsResult<Vec<String>> {
        Err(VfsError::Unsupported("file_attr_strings"))
    }

    /// Read attribute `index` of [`Filesystem::file_attr_strings`].
    fn file_attr_get(&self, _path: &str, _index: usize) -> VfsResult<String> {
        Err(VfsError::Unsupported("file_attr_get"))
    }

    /// Write attribute `index`.
    fn file_attr_set(&self, _path: &str, _index: usize, _value: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported("file_attr_set"))
    }

    // ========================================================================
    // Contents
    // ========================================================================

    /// Open a channel on `path`.
    fn open(&self, _path: &str, _flags: OpenFlags, _perm: u32) -> VfsResult<Channel> {
        Err(VfsError::Unsupported("open"))
    }

    /// Names in `dir` matching `pattern`, as full paths. With no pattern,
    /// returns `dir` itself when it exists and has an accepted type. In
    /// `GlobTypes::MOUNTS` mode only mount points directly below `dir` are
    /// listed.
    fn match_in_directory(
        &self,
        _dir: &str,
        _pattern: Option<&str>,
        _types: GlobTypes,
    ) -> VfsResult<Vec<String>> {
        Err(VfsError::Unsupported("match_in_directory"))
    }

    /// Read a symbolic link.
    fn readlink(&self, _path: &str) -> VfsResult<String> {
        Err(VfsError::Unsupported("readlink"))
    }

    /// Create a link at `link` pointing to `target`.
    fn link(&self, _link: &str, _target: &str, _symbolic: bool) -> VfsResult<()> {
        Err(VfsError::Unsupported("link"))
    }

    /// Decide how the platform loader can reach `path`. `CrossDevice` means
    /// the caller must copy the file to the native filesystem first.
    fn load_file(&self, _path: &str) -> VfsResult<LoadTarget> {
        Err(VfsError::Unsupported("load_file"))
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Create a directory.
    fn create_directory(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported("create_directory"))
    }

    /// Remove a directory.
    fn remove_directory(&self, _path: &str, _recursive: bool) -> VfsResult<()> {
        Err(VfsError::Unsupported("remove_directory"))
    }

    /// Delete a file.
    fn delete_file(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported("delete_file"))
    }

    /// Copy a file within this backend.
    fn copy_file(&self, _from: &str, _to: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported("copy_file"))
    }

    /// Rename within this backend.
    fn rename_file(&self, _from: &str, _to: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported("rename_file"))
    }

    // ========================================================================
    // Working directory
    // ========================================================================

    /// Ask the backend for the current directory.
    fn get_cwd(&self) -> VfsResult<String> {
        Err(VfsError::Unsupported("get_cwd"))
    }

    /// Tell the backend the current directory is changing to `path`.
    fn chdir(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported("chdir"))
    }
}
