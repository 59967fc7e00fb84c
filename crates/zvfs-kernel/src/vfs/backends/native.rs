//! Native filesystem backend.
//!
//! Thin wrapper over `std::fs`. It claims every path, so it is always the
//! tail of the registry and catches whatever no other backend wants.

use std::fs;
use std::io::SeekFrom;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::chan::{ChanMode, ChanResult, Channel, ChannelDriver, DriverCaps};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::filesystem::{Filesystem, LoadTarget, NativeRep};
use crate::vfs::pattern;
use crate::vfs::types::{AccessMode, FileAttr, FileType, GlobTypes, OpenFlags};

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);

/// Native filesystem backend.
#[derive(Debug, Clone, Default)]
pub struct NativeFs;

impl NativeFs {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }

    fn metadata_to_attr(meta: &fs::Metadata) -> FileAttr {
        let kind = if meta.is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        };

        FileAttr {
            size: meta.len(),
            kind,
            perm: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            atime: meta.accessed().ok(),
            nlink: meta.nlink() as u32,
        }
    }

    fn existing(path: &str) -> VfsResult<&Path> {
        if path.is_empty() {
            return Err(VfsError::not_found("empty path"));
        }
        Ok(Path::new(path))
    }
}

impl Filesystem for NativeFs {
    fn path_in_filesystem(&self, _path: &str) -> bool {
        true
    }

    fn list_volumes(&self) -> Vec<String> {
        vec!["/".to_string()]
    }

    fn path_type(&self, _path: &str) -> VfsResult<String> {
        Ok("native".to_string())
    }

    /// Resolve symlinks in the longest prefix of `path` that exists. The
    /// part before `checkpoint` is already canonical and is not revisited.
    fn normalize_path(&self, path: &mut String, checkpoint: usize) -> usize {
        if path.is_empty() || path.starts_with("//") {
            return checkpoint;
        }
        let mut boundaries: Vec<usize> = path
            .char_indices()
            .filter(|&(i, c)| c == '/' && i > checkpoint)
            .map(|(i, _)| i)
            .collect();
        boundaries.push(path.len());

        let mut existing = checkpoint;
        let mut linked = false;
        for &b in &boundaries {
            match fs::symlink_metadata(&path[..b]) {
                Ok(meta) => {
                    existing = b;
                    linked |= meta.file_type().is_symlink();
                }
                Err(_) => break,
            }
        }
        if !linked {
            return existing;
        }
        match dunce::canonicalize(&path[..existing]) {
            Ok(canonical) => {
                let canonical = canonical.to_string_lossy().into_owned();
                let rest = path[existing..].to_string();
                let end = canonical.len();
                *path = canonical + &rest;
                end
            }
            Err(_) => checkpoint,
        }
    }

    fn create_native_rep(&self, path: &str) -> Option<NativeRep> {
        Some(Arc::new(PathBuf::from(path)))
    }

    fn internal_to_normalized(&self, rep: &NativeRep) -> Option<String> {
        rep.downcast_ref::<PathBuf>()
            .map(|p| p.to_string_lossy().into_owned())
    }

    fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let meta = fs::metadata(Self::existing(path)?)?;
        Ok(Self::metadata_to_attr(&meta))
    }

    fn lstat(&self, path: &str) -> VfsResult<FileAttr> {
        let meta = fs::symlink_metadata(Self::existing(path)?)?;
        Ok(Self::metadata_to_attr(&meta))
    }

    fn access(&self, path: &str, mode: AccessMode) -> VfsResult<()> {
        let meta = fs::metadata(Self::existing(path)?)?;
        let bits = meta.permissions().mode();
        let denied = (mode.read && bits & 0o444 == 0)
            || (mode.write && meta.permissions().readonly())
            || (mode.execute && bits & 0o111 == 0);
        if denied {
            return Err(VfsError::permission_denied(path));
        }
        Ok(())
    }

    fn utime(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let file = fs::File::open(Self::existing(path)?)?;
        let times = fs::FileTimes::new().set_accessed(atime).set_modified(mtime);
        file.set_times(times)?;
        Ok(())
    }

    fn open(&self, path: &str, flags: OpenFlags, perm: u32) -> VfsResult<Channel> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = fs::OpenOptions::new()
            .read(flags.read)
            .write(flags.write && !flags.append)
            .append(flags.append)
            .create(flags.create && !flags.exclusive)
            .create_new(flags.exclusive)
            .truncate(flags.truncate)
            .mode(if perm == 0 { 0o666 } else { perm })
            .open(Self::existing(path)?)?;

        let mode = ChanMode {
            readable: flags.read,
            writable: flags.write,
        };
        let id = NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed);
        Ok(Channel::new(
            format!("file{id}"),
            mode,
            Box::new(FileDriver { file }),
        ))
    }

    fn match_in_directory(
        &self,
        dir: &str,
        pattern: Option<&str>,
        types: GlobTypes,
    ) -> VfsResult<Vec<String>> {
        if types.mounts {
            // Nothing is mounted on the native filesystem.
            return Ok(Vec::new());
        }
        let Some(pattern) = pattern else {
            return Ok(match fs::metadata(Self::existing(dir)?) {
                Ok(meta) if types.accepts(meta.is_dir()) => vec![dir.to_string()],
                _ => Vec::new(),
            });
        };

        let matcher = pattern::matcher(pattern)?;
        let mut out = Vec::new();
        for entry in fs::read_dir(Self::existing(dir)?)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !pattern::hidden_ok(&name, pattern) || !matcher.is_match(&name) {
                continue;
            }
            let full = entry.path();
            let is_dir = fs::metadata(&full).map(|m| m.is_dir()).unwrap_or(false);
            if types.accepts(is_dir) {
                out.push(full.to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    fn readlink(&self, path: &str) -> VfsResult<String> {
        Ok(fs::read_link(Self::existing(path)?)?
            .to_string_lossy()
            .into_owned())
    }

    fn link(&self, link: &str, target: &str, symbolic: bool) -> VfsResult<()> {
        if symbolic {
            std::os::unix::fs::symlink(target, link)?;
        } else {
            fs::hard_link(target, link)?;
        }
        Ok(())
    }

    fn load_file(&self, path: &str) -> VfsResult<LoadTarget> {
        let p = Self::existing(path)?;
        if !p.is_file() {
            return Err(VfsError::not_found(path));
        }
        Ok(LoadTarget {
            path: p.to_path_buf(),
            temporary: false,
        })
    }

    fn create_directory(&self, path: &str) -> VfsResult<()> {
        fs::create_dir(Self::existing(path)?)?;
        Ok(())
    }

    fn remove_directory(&self, path: &str, recursive: bool) -> VfsResult<()> {
        let p = Self::existing(path)?;
        if recursive {
            fs::remove_dir_all(p)?;
        } else {
            fs::remove_dir(p)?;
        }
        Ok(())
    }

    fn delete_file(&self, path: &str) -> VfsResult<()> {
        fs::remove_file(Self::existing(path)?)?;
        Ok(())
    }

    fn copy_file(&self, from: &str, to: &str) -> VfsResult<()> {
        fs::copy(Self::existing(from)?, Self::existing(to)?)?;
        Ok(())
    }

    fn rename_file(&self, from: &str, to: &str) -> VfsResult<()> {
        fs::rename(Self::existing(from)?, Self::existing(to)?)?;
        Ok(())
    }

    fn get_cwd(&self) -> VfsResult<String> {
        let cwd = std::env::current_dir()?;
        Ok(dunce::simplified(&cwd).to_string_lossy().into_owned())
    }

    fn chdir(&self, path: &str) -> VfsResult<()> {
        std::env::set_current_dir(Self::existing(path)?)?;
        Ok(())
    }
}

/// Channel driver over an open file.
struct FileDriver {
    file: fs::File,
}

impl ChannelDriver for FileDriver {
    fn type_name(&self) -> &'static str {
        "file"
    }

    fn caps(&self) -> DriverCaps {
        DriverCaps {
            seek: true,
            ..Default::default()
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> ChanResult<usize> {
        use std::io::Read;
        Ok(self.file.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> ChanResult<usize> {
        use std::io::Write;
        Ok(self.file.write(buf)?)
    }

    fn seek(&mut self, pos: SeekFrom) -> ChanResult<u64> {
        use std::io::Seek;
        Ok(self.file.seek(pos)?)
    }

    fn close(&mut self) -> ChanResult<()> {
        use std::io::Write;
        Ok(self.file.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        let root = dunce::canonicalize(dir.path())
            .unwrap()
            .to_string_lossy()
            .into_owned();
        fs::write(format!("{root}/a.txt"), b"alpha").unwrap();
        fs::write(format!("{root}/.hidden"), b"").unwrap();
        fs::create_dir(format!("{root}/sub")).unwrap();
        (dir, root)
    }

    #[test]
    fn test_claims_everything() {
        let fs = NativeFs::new();
        assert!(fs.path_in_filesystem(""));
        assert!(fs.path_in_filesystem("/anything"));
        assert!(fs.path_in_filesystem("//zipfs:/x"));
    }

    #[test]
    fn test_empty_path_not_found() {
        let fs = NativeFs::new();
        assert!(fs.stat("").unwrap_err().is_not_found());
        assert!(fs.access("", AccessMode::EXISTS).unwrap_err().is_not_found());
    }

    #[test]
    fn test_stat_and_read() {
        let (_dir, root) = setup();
        let fs = NativeFs::new();
        let path = format!("{root}/a.txt");
        let attr = fs.stat(&path).unwrap();
        assert!(attr.is_file());
        assert_eq!(attr.size, 5);

        let mut chan = fs.open(&path, OpenFlags::read(), 0).unwrap();
        assert_eq!(chan.read_to_vec().unwrap(), b"alpha");
        chan.close().unwrap();
    }

    #[test]
    fn test_write_through_channel() {
        let (_dir, root) = setup();
        let fs = NativeFs::new();
        let path = format!("{root}/new.txt");
        let mut chan = fs.open(&path, OpenFlags::write_truncate(), 0o644).unwrap();
        chan.write_all_bytes(b"hello").unwrap();
        chan.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_match_in_directory() {
        let (_dir, root) = setup();
        let fs = NativeFs::new();

        let all = fs.match_in_directory(&root, Some("*"), GlobTypes::ANY).unwrap();
        assert_eq!(all, vec![format!("{root}/a.txt"), format!("{root}/sub")]);

        let dirs = fs.match_in_directory(&root, Some("*"), GlobTypes::DIRS).unwrap();
        assert_eq!(dirs, vec![format!("{root}/sub")]);

        let hidden = fs.match_in_directory(&root, Some(".*"), GlobTypes::FILES).unwrap();
        assert_eq!(hidden, vec![format!("{root}/.hidden")]);

        let exists = fs.match_in_directory(&root, None, GlobTypes::DIRS).unwrap();
        assert_eq!(exists, vec![root.clone()]);
        assert!(fs.match_in_directory(&root, None, GlobTypes::FILES).unwrap().is_empty());
    }

    #[test]
    fn test_normalize_resolves_existing_prefix() {
        let (_dir, root) = setup();
        let fs = NativeFs::new();
        std::os::unix::fs::symlink(format!("{root}/sub"), format!("{root}/link")).unwrap();

        let mut p = format!("{root}/link/missing");
        fs.normalize_path(&mut p, 0);
        assert_eq!(p, format!("{root}/sub/missing"));

        let mut v = "//zipfs:/x".to_string();
        assert_eq!(fs.normalize_path(&mut v, 0), 0);
        assert_eq!(v, "//zipfs:/x");
    }

    #[test]
    fn test_normalize_starts_at_checkpoint() {
        let (_dir, root) = setup();
        let fs = NativeFs::new();
        std::os::unix::fs::symlink(format!("{root}/sub"), format!("{root}/link")).unwrap();

        // Plain directories are left alone and the checkpoint moves past them.
        let mut p = format!("{root}/sub/missing");
        let end = fs.normalize_path(&mut p, 0);
        assert_eq!(p, format!("{root}/sub/missing"));
        assert_eq!(end, format!("{root}/sub").len());

        // A prefix up to the checkpoint is taken as already resolved.
        let mut p = format!("{root}/link/missing");
        let mark = format!("{root}/link").len();
        assert_eq!(fs.normalize_path(&mut p, mark), mark);
        assert_eq!(p, format!("{root}/link/missing"));

        let mut p = format!("{root}/link/missing");
        let end = fs.normalize_path(&mut p, root.len());
        assert_eq!(p, format!("{root}/sub/missing"));
        assert_eq!(end, format!("{root}/sub").len());
    }

    #[test]
    fn test_native_rep_round_trip() {
        let fs = NativeFs::new();
        let rep = fs.create_native_rep("/tmp/x").unwrap();
        assert_eq!(fs.internal_to_normalized(&rep).unwrap(), "/tmp/x");
    }
}
