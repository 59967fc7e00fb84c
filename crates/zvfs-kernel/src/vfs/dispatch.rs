//! Path dispatch.
//!
//! [`Vfs`] owns a backend registry and a cwd tracker. Every operation takes
//! an [`FsPath`], normalizes it (memoized on the path), finds the backend
//! that claims the normalized form (memoized with the registry epoch) and
//! forwards the call.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use super::backends::NativeFs;
use super::cwd::CwdTracker;
use super::error::{VfsError, VfsResult};
use super::filesystem::{Filesystem, LoadTarget, NativeRep};
use super::path::{FsPath, NormKey, PathKind, normalize_lexical_from};
use super::registry::{FsRecord, FsRegistry};
use super::types::{AccessMode, FileAttr, GlobTypes, OpenFlags};
use crate::chan::Channel;

static NEXT_VFS_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL: OnceLock<Vfs> = OnceLock::new();

/// The dispatcher.
pub struct Vfs {
    id: u64,
    registry: FsRegistry,
    cwd: CwdTracker,
    down: AtomicBool,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("id", &self.id)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// A dispatcher with only the native backend.
    pub fn new() -> Self {
        Self::with_default(Arc::new(NativeFs::new()))
    }

    /// A dispatcher whose tail backend is `default_fs`.
    pub fn with_default(default_fs: Arc<dyn Filesystem>) -> Self {
        let id = NEXT_VFS_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            registry: FsRegistry::new("native", default_fs),
            cwd: CwdTracker::new(id),
            down: AtomicBool::new(false),
        }
    }

    /// The process-wide dispatcher.
    pub fn global() -> &'static Vfs {
        GLOBAL.get_or_init(Vfs::new)
    }

    /// Drop every non-default backend and forget the cwd. Registration is
    /// refused until [`Vfs::reinitialize`].
    pub fn shutdown(&self) {
        self.down.store(true, Ordering::Release);
        self.registry.reset();
        self.cwd.clear();
        tracing::debug!("vfs {} shut down", self.id);
    }

    /// Back to a pristine native-only state that accepts registrations.
    pub fn reinitialize(&self) {
        self.registry.reset();
        self.cwd.clear();
        self.down.store(false, Ordering::Release);
        tracing::debug!("vfs {} reinitialized", self.id);
    }

    /// Whether [`Vfs::shutdown`] ran without a later reinitialize.
    pub fn is_shut_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// The backend list.
    pub fn registry(&self) -> &FsRegistry {
        &self.registry
    }

    /// Put `fs` at the head of the list.
    pub fn register(&self, name: impl Into<String>, fs: Arc<dyn Filesystem>) -> VfsResult<()> {
        if self.is_shut_down() {
            return Err(VfsError::other("filesystem layer is shut down"));
        }
        self.registry.register(name, fs)
    }

    /// Remove `fs`.
    pub fn unregister(&self, fs: &Arc<dyn Filesystem>) -> VfsResult<()> {
        self.registry.unregister(fs)
    }

    /// Invalidate cached bindings after a backend changed its path space.
    pub fn notify_mounts_changed(&self) {
        self.registry.notify_mounts_changed();
    }

    /// Current registry epoch.
    pub fn epoch(&self) -> u64 {
        self.registry.epoch()
    }

    /// Volume roots of every backend.
    pub fn list_volumes(&self) -> Vec<String> {
        self.registry.list_volumes()
    }

    // ========================================================================
    // Paths
    // ========================================================================

    /// Tilde-expanded text of `path`.
    pub fn translated(&self, path: &FsPath) -> String {
        path.translated()
    }

    /// Absolute normalized form of `path`, memoized on the path.
    pub fn normalized(&self, path: &FsPath) -> VfsResult<FsPath> {
        if path.as_str().is_empty() {
            let key = self.key(None);
            return Ok(path.store_normalized(key, String::new()));
        }
        match path.kind() {
            PathKind::Absolute => {
                let key = self.key(None);
                if let Some(hit) = path.cached_normalized(key) {
                    return Ok(hit);
                }
                tracing::trace!("normalize miss: {}", path);
                let text = self.normalize_text(path.translated(), 0);
                Ok(path.store_normalized(key, text))
            }
            PathKind::Joined => {
                let key = self.key(None);
                if let Some(hit) = path.cached_normalized(key) {
                    return Ok(hit);
                }
                let Some(base) = path.base() else {
                    let text = self.normalize_text(path.translated(), 0);
                    return Ok(path.store_normalized(key, text));
                };
                let base_norm = self.normalized(base)?;
                let suffix = &path.as_str()[base.as_str().len()..];
                let checkpoint = base_norm.as_str().len();
                let text = self.normalize_text(format!("{}{}", base_norm.as_str(), suffix), checkpoint);
                Ok(path.store_normalized(key, text))
            }
            PathKind::Relative => {
                let cwd = self.get_cwd()?;
                let key = self.key(Some(self.cwd.epoch()));
                if let Some(hit) = path.cached_normalized(key) {
                    return Ok(hit);
                }
                let joined = if cwd.as_str().ends_with('/') {
                    format!("{}{}", cwd.as_str(), path.as_str())
                } else {
                    format!("{}/{}", cwd.as_str(), path.as_str())
                };
                let text = self.normalize_text(joined, cwd.as_str().len());
                Ok(path.store_normalized(key, text))
            }
        }
    }

    fn key(&self, cwd_epoch: Option<u64>) -> NormKey {
        NormKey {
            vfs_id: self.id,
            fs_epoch: self.registry.epoch(),
            cwd_epoch,
        }
    }

    /// Lexical cleanup from `checkpoint`, then the backends' hooks: native
    /// first, then the rest head to tail.
    fn normalize_text(&self, text: String, checkpoint: usize) -> String {
        let mut text = normalize_lexical_from(&text, checkpoint).into_owned();
        let default = self.registry.default_record();
        let mut checkpoint = default.fs.normalize_path(&mut text, checkpoint);
        let records: Vec<Arc<FsRecord>> = self.registry.iter().iter().cloned().collect();
        for record in records.iter().filter(|r| !r.is_default) {
            checkpoint = record.fs.normalize_path(&mut text, checkpoint);
        }
        text
    }

    /// Whether two paths name the same file, by string form first and then
    /// by normalized form.
    pub fn paths_equal(&self, a: &FsPath, b: &FsPath) -> bool {
        if a.as_str() == b.as_str() {
            return true;
        }
        match (self.normalized(a), self.normalized(b)) {
            (Ok(x), Ok(y)) => x.as_str() == y.as_str(),
            _ => false,
        }
    }

    /// The backend that owns `path`.
    pub fn filesystem_for_path(&self, path: &FsPath) -> Option<Arc<FsRecord>> {
        let cacheable = path.kind() != PathKind::Relative;
        let epoch = self.registry.epoch();
        if cacheable {
            if let Some(record) = path.cached_binding(self.id, epoch) {
                return Some(record);
            }
        }
        let norm = self.normalized(path).ok()?;
        tracing::trace!("binding miss: {}", norm);
        let record = self.registry.find(norm.as_str())?;
        if cacheable {
            path.store_binding(self.id, epoch, Arc::clone(&record));
        }
        Some(record)
    }

    /// `record`'s native representation of `path`, or `None` when another
    /// backend owns it.
    pub fn native_rep(&self, path: &FsPath, record: &Arc<FsRecord>) -> Option<NativeRep> {
        let epoch = self.registry.epoch();
        let cacheable = path.kind() != PathKind::Relative;
        if cacheable {
            if let Some(rep) = path.cached_native(self.id, epoch, record) {
                return Some(rep);
            }
        }
        let mut owner = self.filesystem_for_path(path)?;
        if !Arc::ptr_eq(&owner, record) {
            path.clear_binding();
            owner = self.filesystem_for_path(path)?;
            if !Arc::ptr_eq(&owner, record) {
                return None;
            }
        }
        let norm = self.normalized(path).ok()?;
        let rep = record.fs.create_native_rep(norm.as_str())?;
        if cacheable {
            path.store_native(self.id, epoch, Arc::clone(record), Arc::clone(&rep));
        }
        Some(rep)
    }

    fn owner(&self, path: &FsPath) -> VfsResult<(FsPath, Arc<FsRecord>)> {
        let norm = self.normalized(path)?;
        let record = self
            .filesystem_for_path(path)
            .ok_or_else(|| VfsError::not_found(path.as_str()))?;
        Ok((norm, record))
    }

    // ========================================================================
    // Working directory
    // ========================================================================

    /// The current directory, re-probed through its backend when that
    /// backend tracks one.
    pub fn get_cwd(&self) -> VfsResult<FsPath> {
        let current = self.cwd.current();
        let owner = match &current {
            Some(path) => self.filesystem_for_path(path),
            None => Some(self.registry.default_record()),
        };
        if let Some(record) = owner {
            match record.fs.get_cwd() {
                Ok(text) => {
                    let norm = self.normalized(&FsPath::from_text(text))?;
                    let changed = current.as_ref().map(FsPath::as_str) != Some(norm.as_str());
                    if changed {
                        self.cwd.update(Some(norm.clone()));
                    }
                    return Ok(norm);
                }
                Err(e) if e.is_unsupported() => {}
                Err(e) => return Err(e),
            }
        }
        current.ok_or_else(|| VfsError::not_found("current directory"))
    }

    /// Change the current directory.
    pub fn set_cwd(&self, path: &FsPath) -> VfsResult<()> {
        let (norm, record) = self.owner(path)?;
        match record.fs.chdir(norm.as_str()) {
            Ok(()) => {}
            Err(e) if e.is_unsupported() => {
                if !record.fs.stat(norm.as_str())?.is_dir() {
                    return Err(VfsError::not_a_directory(norm.as_str()));
                }
                record.fs.access(norm.as_str(), AccessMode::READ)?;
            }
            Err(e) => return Err(e),
        }
        tracing::debug!("cwd -> {} ({})", norm, record.name);
        self.cwd.update(Some(norm));
        Ok(())
    }

    // ========================================================================
    // Dispatched operations
    // ========================================================================

    /// Attributes, following links.
    pub fn stat(&self, path: &FsPath) -> VfsResult<FileAttr> {
        let (norm, record) = self.owner(path)?;
        record.fs.stat(norm.as_str())
    }

    /// Attributes, not following links.
    pub fn lstat(&self, path: &FsPath) -> VfsResult<FileAttr> {
        let (norm, record) = self.owner(path)?;
        record.fs.lstat(norm.as_str())
    }

    /// Permission check.
    pub fn access(&self, path: &FsPath, mode: AccessMode) -> VfsResult<()> {
        let (norm, record) = self.owner(path)?;
        record.fs.access(norm.as_str(), mode)
    }

    /// Set times.
    pub fn utime(&self, path: &FsPath, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let (norm, record) = self.owner(path)?;
        record.fs.utime(norm.as_str(), atime, mtime)
    }

    /// Open a channel.
    pub fn open(&self, path: &FsPath, flags: OpenFlags, perm: u32) -> VfsResult<Channel> {
        let (norm, record) = self.owner(path)?;
        record.fs.open(norm.as_str(), flags, perm)
    }

    /// Names in `dir` matching `pattern`. When directories are wanted, mount
    /// points other backends provide directly below `dir` are merged in.
    pub fn glob(
        &self,
        dir: &FsPath,
        pattern: Option<&str>,
        types: GlobTypes,
    ) -> VfsResult<Vec<String>> {
        let (norm, owner) = self.owner(dir)?;
        let mut out = owner.fs.match_in_directory(norm.as_str(), pattern, types)?;
        if types.mounts || !types.dirs || pattern.is_none() {
            return Ok(out);
        }
        let records: Vec<Arc<FsRecord>> = self.registry.iter().iter().cloned().collect();
        for record in records.iter().filter(|r| !Arc::ptr_eq(r, &owner)) {
            match record
                .fs
                .match_in_directory(norm.as_str(), pattern, GlobTypes::MOUNTS)
            {
                Ok(found) => {
                    for name in found {
                        if !out.contains(&name) {
                            out.push(name);
                        }
                    }
                }
                Err(e) if e.is_unsupported() => {}
                Err(e) => return Err(e),
            }
        }
        out.sort();
        Ok(out)
    }

    /// Backend-specific attribute names.
    pub fn file_attr_strings(&self, path: &FsPath) -> VfsResult<Vec<String>> {
        let (norm, record) = self.owner(path)?;
        record.fs.file_attr_strings(norm.as_str())
    }

    /// Read an attribute.
    pub fn file_attr_get(&self, path: &FsPath, index: usize) -> VfsResult<String> {
        let (norm, record) = self.owner(path)?;
        record.fs.file_attr_get(norm.as_str(), index)
    }

    /// Write an attribute.
    pub fn file_attr_set(&self, path: &FsPath, index: usize, value: &str) -> VfsResult<()> {
        let (norm, record) = self.owner(path)?;
        record.fs.file_attr_set(norm.as_str(), index, value)
    }

    /// Type tag of the owning backend.
    pub fn path_type(&self, path: &FsPath) -> VfsResult<String> {
        let (norm, record) = self.owner(path)?;
        record.fs.path_type(norm.as_str())
    }

    /// Separator of the owning backend.
    pub fn separator(&self, path: &FsPath) -> VfsResult<char> {
        let (norm, record) = self.owner(path)?;
        Ok(record.fs.separator(norm.as_str()))
    }

    /// Read a link.
    pub fn readlink(&self, path: &FsPath) -> VfsResult<String> {
        let (norm, record) = self.owner(path)?;
        record.fs.readlink(norm.as_str())
    }

    /// Create a link at `link`.
    pub fn link(&self, link: &FsPath, target: &FsPath, symbolic: bool) -> VfsResult<()> {
        let (norm, record) = self.owner(link)?;
        let target = self.normalized(target)?;
        record.fs.link(norm.as_str(), target.as_str(), symbolic)
    }

    /// Create a directory.
    pub fn create_directory(&self, path: &FsPath) -> VfsResult<()> {
        let (norm, record) = self.owner(path)?;
        record.fs.create_directory(norm.as_str())
    }

    /// Remove a directory.
    pub fn remove_directory(&self, path: &FsPath, recursive: bool) -> VfsResult<()> {
        let (norm, record) = self.owner(path)?;
        record.fs.remove_directory(norm.as_str(), recursive)
    }

    /// Delete a file.
    pub fn delete_file(&self, path: &FsPath) -> VfsResult<()> {
        let (norm, record) = self.owner(path)?;
        record.fs.delete_file(norm.as_str())
    }

    /// Copy a file, through channels when the backends differ or the owner
    /// can't copy in place.
    pub fn copy_file(&self, from: &FsPath, to: &FsPath) -> VfsResult<()> {
        let (src, src_fs) = self.owner(from)?;
        let (dst, dst_fs) = self.owner(to)?;
        if Arc::ptr_eq(&src_fs, &dst_fs) {
            match src_fs.fs.copy_file(src.as_str(), dst.as_str()) {
                Err(VfsError::Unsupported(_)) | Err(VfsError::CrossDevice) => {}
                other => return other,
            }
        }
        let mut reader = src_fs.fs.open(src.as_str(), OpenFlags::read(), 0)?;
        let mut writer = dst_fs
            .fs
            .open(dst.as_str(), OpenFlags::write_truncate(), 0o644)?;
        io::copy(&mut reader, &mut writer)?;
        writer.close().map_err(io::Error::from)?;
        reader.close().map_err(io::Error::from)?;
        Ok(())
    }

    /// Rename within one backend.
    pub fn rename_file(&self, from: &FsPath, to: &FsPath) -> VfsResult<()> {
        let (src, src_fs) = self.owner(from)?;
        let (dst, dst_fs) = self.owner(to)?;
        if !Arc::ptr_eq(&src_fs, &dst_fs) {
            return Err(VfsError::CrossDevice);
        }
        src_fs.fs.rename_file(src.as_str(), dst.as_str())
    }

    /// Make `path` reachable by the platform loader, copying it to a
    /// temporary native file when its backend can't hand it over in place.
    pub fn load_file(&self, path: &FsPath) -> VfsResult<LoadTarget> {
        let (norm, record) = self.owner(path)?;
        match record.fs.load_file(norm.as_str()) {
            Err(VfsError::CrossDevice) | Err(VfsError::Unsupported(_)) => {
                self.copy_to_temp(&norm, &record)
            }
            other => other,
        }
    }

    fn copy_to_temp(&self, norm: &FsPath, record: &Arc<FsRecord>) -> VfsResult<LoadTarget> {
        let mut chan = record.fs.open(norm.as_str(), OpenFlags::read(), 0)?;
        let leaf = norm.as_str().rsplit('/').next().unwrap_or("load");
        let mut tmp = tempfile::Builder::new()
            .prefix("zvfs-")
            .suffix(&format!("-{leaf}"))
            .tempfile()?;
        io::copy(&mut chan, &mut tmp)?;
        chan.close().map_err(io::Error::from)?;
        let (_, path) = tmp.keep().map_err(|e| VfsError::Io(e.error))?;
        tracing::debug!("copied {} to {} for loading", norm, path.display());
        Ok(LoadTarget {
            path,
            temporary: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFs;

    #[test]
    fn test_memory_backend_dispatch() {
        let vfs = Vfs::new();
        let mem = Arc::new(MemoryFs::new("/scratch"));
        mem.write_file("/scratch/a.txt", b"alpha").unwrap();
        vfs.register("memory", mem).unwrap();

        let path = FsPath::from_text("/scratch/./a.txt");
        assert_eq!(vfs.normalized(&path).unwrap().as_str(), "/scratch/a.txt");
        assert_eq!(vfs.stat(&path).unwrap().size, 5);
        assert_eq!(vfs.path_type(&path).unwrap(), "memory");
        assert_eq!(vfs.filesystem_for_path(&path).unwrap().name, "memory");
    }

    #[test]
    fn test_shutdown_and_reinitialize() {
        let vfs = Vfs::new();
        vfs.register("memory", Arc::new(MemoryFs::new("/m"))).unwrap();
        vfs.shutdown();
        assert!(vfs.is_shut_down());
        assert_eq!(vfs.registry().names(), vec!["native"]);
        assert!(vfs.register("again", Arc::new(MemoryFs::new("/m"))).is_err());

        vfs.reinitialize();
        assert!(!vfs.is_shut_down());
        vfs.register("again", Arc::new(MemoryFs::new("/m"))).unwrap();
        assert_eq!(vfs.registry().names(), vec!["again", "native"]);
    }

    #[test]
    fn test_empty_path() {
        let vfs = Vfs::new();
        let empty = FsPath::from_text("");
        assert_eq!(vfs.normalized(&empty).unwrap().as_str(), "");
        assert!(vfs.stat(&empty).unwrap_err().is_not_found());
    }

    #[test]
    fn test_cross_backend_copy() {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let dst = FsPath::from_text(root.join("copied.txt").to_string_lossy().into_owned());

        let vfs = Vfs::new();
        let mem = Arc::new(MemoryFs::new("/mem"));
        mem.write_file("/mem/f", b"payload").unwrap();
        vfs.register("memory", mem).unwrap();

        vfs.copy_file(&FsPath::from_text("/mem/f"), &dst).unwrap();
        assert_eq!(std::fs::read(dst.as_str()).unwrap(), b"payload");
        assert!(matches!(
            vfs.rename_file(&FsPath::from_text("/mem/f"), &dst).unwrap_err(),
            VfsError::CrossDevice
        ));
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(Vfs::global(), Vfs::global()));
    }
}
