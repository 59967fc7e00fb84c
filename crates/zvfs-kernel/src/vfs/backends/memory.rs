//! In-memory filesystem backend.
//!
//! Mounted under a prefix (for example `/scratch`) and owns everything
//! below it. Used for scratch space and as the reference user-defined
//! backend in tests. All data is ephemeral.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::chan::{ChanError, ChanMode, ChanResult, Channel, ChannelDriver, DriverCaps};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::filesystem::Filesystem;
use crate::vfs::pattern;
use crate::vfs::types::{AccessMode, FileAttr, FileType, GlobTypes, OpenFlags};

static NEXT_MEM_ID: AtomicU64 = AtomicU64::new(0);

/// Entry in the memory filesystem.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, attr: FileAttr },
    Directory { attr: FileAttr },
    Symlink { target: String, attr: FileAttr },
}

impl Entry {
    fn attr(&self) -> &FileAttr {
        match self {
            Entry::File { attr, .. } => attr,
            Entry::Directory { attr } => attr,
            Entry::Symlink { attr, .. } => attr,
        }
    }

    fn attr_mut(&mut self) -> &mut FileAttr {
        match self {
            Entry::File { attr, .. } => attr,
            Entry::Directory { attr } => attr,
            Entry::Symlink { attr, .. } => attr,
        }
    }
}

type Entries = Arc<RwLock<HashMap<String, Entry>>>;

/// In-memory filesystem mounted at a prefix.
#[derive(Debug)]
pub struct MemoryFs {
    prefix: String,
    entries: Entries,
}

impl MemoryFs {
    /// Create an empty filesystem owning `prefix` and everything below it.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        let mut entries = HashMap::new();
        // Root directory always exists
        entries.insert(
            String::new(),
            Entry::Directory {
                attr: FileAttr::directory(0o755),
            },
        );
        Self {
            prefix,
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    /// The mount prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Path relative to the prefix, or `None` if not ours.
    fn key(&self, path: &str) -> Option<String> {
        if path == self.prefix {
            return Some(String::new());
        }
        path.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .map(|rest| rest.trim_end_matches('/').to_string())
    }

    fn key_or_not_found(&self, path: &str) -> VfsResult<String> {
        self.key(path).ok_or_else(|| VfsError::not_found(path))
    }

    fn full(&self, key: &str) -> String {
        if key.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn parent_key(key: &str) -> Option<&str> {
        if key.is_empty() {
            None
        } else {
            Some(key.rsplit_once('/').map(|(p, _)| p).unwrap_or(""))
        }
    }

    /// Ensure all parent directories exist.
    fn ensure_parents(entries: &mut HashMap<String, Entry>, key: &str) {
        let mut current = String::new();
        let Some(parent) = Self::parent_key(key) else {
            return;
        };
        for component in parent.split('/').filter(|c| !c.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(component);
            entries
                .entry(current.clone())
                .or_insert(Entry::Directory {
                    attr: FileAttr::directory(0o755),
                });
        }
    }

    /// Write a whole file, creating parents.
    pub fn write_file(&self, path: &str, data: &[u8]) -> VfsResult<()> {
        let key = self.key_or_not_found(path)?;
        let mut entries = self.entries.write();
        if let Some(Entry::Directory { .. }) = entries.get(&key) {
            return Err(VfsError::is_a_directory(path));
        }
        Self::ensure_parents(&mut entries, &key);
        entries.insert(
            key,
            Entry::File {
                data: data.to_vec(),
                attr: FileAttr::file(data.len() as u64, 0o644),
            },
        );
        Ok(())
    }

    /// Read a whole file.
    pub fn read_file(&self, path: &str) -> VfsResult<Vec<u8>> {
        let key = self.key_or_not_found(path)?;
        match self.entries.read().get(&key) {
            Some(Entry::File { data, .. }) => Ok(data.clone()),
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(path)),
            Some(Entry::Symlink { .. }) => Err(VfsError::other("cannot read symlink as file")),
            None => Err(VfsError::not_found(path)),
        }
    }
}

impl Filesystem for MemoryFs {
    fn path_in_filesystem(&self, path: &str) -> bool {
        self.key(path).is_some()
    }

    fn path_type(&self, _path: &str) -> VfsResult<String> {
        Ok("memory".to_string())
    }

    fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let key = self.key_or_not_found(path)?;
        self.entries
            .read()
            .get(&key)
            .map(|e| e.attr().clone())
            .ok_or_else(|| VfsError::not_found(path))
    }

    fn access(&self, path: &str, mode: AccessMode) -> VfsResult<()> {
        let attr = self.stat(path)?;
        let denied = (mode.read && attr.perm & 0o444 == 0)
            || (mode.write && attr.perm & 0o222 == 0)
            || (mode.execute && attr.perm & 0o111 == 0);
        if denied {
            return Err(VfsError::permission_denied(path));
        }
        Ok(())
    }

    fn utime(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let key = self.key_or_not_found(path)?;
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| VfsError::not_found(path))?;
        let attr = entry.attr_mut();
        attr.atime = Some(atime);
        attr.mtime = mtime;
        Ok(())
    }

    fn open(&self, path: &str, flags: OpenFlags, perm: u32) -> VfsResult<Channel> {
        let key = self.key_or_not_found(path)?;
        let data = {
            let mut entries = self.entries.write();
            match entries.get(&key) {
                Some(Entry::Directory { .. }) => return Err(VfsError::is_a_directory(path)),
                Some(Entry::Symlink { .. }) => {
                    return Err(VfsError::other("cannot open symlink"));
                }
                Some(Entry::File { .. }) if flags.exclusive => {
                    return Err(VfsError::already_exists(path));
                }
                Some(Entry::File { data, .. }) => {
                    if flags.truncate {
                        Vec::new()
                    } else {
                        data.clone()
                    }
                }
                None if flags.create => {
                    if let Some(parent) = Self::parent_key(&key) {
                        if !matches!(entries.get(parent), Some(Entry::Directory { .. })) {
                            return Err(VfsError::not_found(self.full(parent)));
                        }
                    }
                    let perm = if perm == 0 { 0o644 } else { perm };
                    entries.insert(
                        key.clone(),
                        Entry::File {
                            data: Vec::new(),
                            attr: FileAttr::file(0, perm),
                        },
                    );
                    Vec::new()
                }
                None => return Err(VfsError::not_found(path)),
            }
        };

        let mode = ChanMode {
            readable: flags.read,
            writable: flags.write,
        };
        let id = NEXT_MEM_ID.fetch_add(1, Ordering::Relaxed);
        Ok(Channel::new(
            format!("mem{id}"),
            mode,
            Box::new(MemoryDriver {
                entries: Arc::clone(&self.entries),
                key,
                data,
                pos: 0,
                writable: flags.write,
                append: flags.append,
                dirty: flags.truncate,
            }),
        ))
    }

    fn match_in_directory(
        &self,
        dir: &str,
        pattern: Option<&str>,
        types: GlobTypes,
    ) -> VfsResult<Vec<String>> {
        if types.mounts {
            return Ok(Vec::new());
        }
        let Some(key) = self.key(dir) else {
            return Ok(Vec::new());
        };
        let entries = self.entries.read();
        let Some(pattern) = pattern else {
            return Ok(match entries.get(&key) {
                Some(e) if types.accepts(e.attr().is_dir()) => vec![dir.to_string()],
                _ => Vec::new(),
            });
        };
        if !matches!(entries.get(&key), Some(Entry::Directory { .. })) {
            return Ok(Vec::new());
        }

        let matcher = pattern::matcher(pattern)?;
        let mut result: Vec<String> = entries
            .iter()
            .filter(|(k, _)| !k.is_empty() && Self::parent_key(k) == Some(key.as_str()))
            .filter(|(k, e)| {
                let name = k.rsplit('/').next().unwrap_or(k);
                pattern::hidden_ok(name, pattern)
                    && matcher.is_match(name)
                    && types.accepts(e.attr().is_dir())
            })
            .map(|(k, _)| self.full(k))
            .collect();
        result.sort();
        Ok(result)
    }

    fn readlink(&self, path: &str) -> VfsResult<String> {
        let key = self.key_or_not_found(path)?;
        match self.entries.read().get(&key) {
            Some(Entry::Symlink { target, .. }) => Ok(target.clone()),
            Some(_) => Err(VfsError::invalid_argument(format!("not a link: {path}"))),
            None => Err(VfsError::not_found(path)),
        }
    }

    fn link(&self, link: &str, target: &str, symbolic: bool) -> VfsResult<()> {
        if !symbolic {
            return Err(VfsError::Unsupported("hard links"));
        }
        let key = self.key_or_not_found(link)?;
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(VfsError::already_exists(link));
        }
        Self::ensure_parents(&mut entries, &key);
        let mut attr = FileAttr::file(target.len() as u64, 0o777);
        attr.kind = FileType::Symlink;
        entries.insert(
            key,
            Entry::Symlink {
                target: target.to_string(),
                attr,
            },
        );
        Ok(())
    }

    fn create_directory(&self, path: &str) -> VfsResult<()> {
        let key = self.key_or_not_found(path)?;
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(VfsError::already_exists(path));
        }
        if let Some(parent) = Self::parent_key(&key) {
            if !matches!(entries.get(parent), Some(Entry::Directory { .. })) {
                return Err(VfsError::not_found(self.full(parent)));
            }
        }
        entries.insert(
            key,
            Entry::Directory {
                attr: FileAttr::directory(0o755),
            },
        );
        Ok(())
    }

    fn remove_directory(&self, path: &str, recursive: bool) -> VfsResult<()> {
        let key = self.key_or_not_found(path)?;
        if key.is_empty() {
            return Err(VfsError::permission_denied("cannot remove root"));
        }
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(Entry::Directory { .. }) => {}
            Some(_) => return Err(VfsError::not_a_directory(path)),
            None => return Err(VfsError::not_found(path)),
        }
        let child_prefix = format!("{key}/");
        let children: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(&child_prefix))
            .cloned()
            .collect();
        if !children.is_empty() && !recursive {
            return Err(VfsError::DirectoryNotEmpty(path.to_string()));
        }
        for child in children {
            entries.remove(&child);
        }
        entries.remove(&key);
        Ok(())
    }

    fn delete_file(&self, path: &str) -> VfsResult<()> {
        let key = self.key_or_not_found(path)?;
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(path)),
            Some(_) => {
                entries.remove(&key);
                Ok(())
            }
            None => Err(VfsError::not_found(path)),
        }
    }

    fn copy_file(&self, from: &str, to: &str) -> VfsResult<()> {
        let data = self.read_file(from)?;
        self.write_file(to, &data)
    }

    fn rename_file(&self, from: &str, to: &str) -> VfsResult<()> {
        let from_key = self.key_or_not_found(from)?;
        let to_key = self.key_or_not_found(to)?;
        let mut entries = self.entries.write();
        let entry = entries
            .remove(&from_key)
            .ok_or_else(|| VfsError::not_found(from))?;

        // Directories carry their children along.
        if matches!(entry, Entry::Directory { .. }) {
            let child_prefix = format!("{from_key}/");
            let children: Vec<String> = entries
                .keys()
                .filter(|k| k.starts_with(&child_prefix))
                .cloned()
                .collect();
            for child in children {
                if let Some(child_entry) = entries.remove(&child) {
                    let moved = format!("{}/{}", to_key, &child[child_prefix.len()..]);
                    entries.insert(moved, child_entry);
                }
            }
        }
        Self::ensure_parents(&mut entries, &to_key);
        entries.insert(to_key, entry);
        Ok(())
    }
}

/// Channel over a snapshot of a memory file. Writes land on close.
struct MemoryDriver {
    entries: Entries,
    key: String,
    data: Vec<u8>,
    pos: usize,
    writable: bool,
    append: bool,
    dirty: bool,
}

impl ChannelDriver for MemoryDriver {
    fn type_name(&self) -> &'static str {
        "memory"
    }

    fn caps(&self) -> DriverCaps {
        DriverCaps {
            seek: true,
            ..Default::default()
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> ChanResult<usize> {
        let start = self.pos.min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos = start + n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> ChanResult<usize> {
        if self.append {
            self.pos = self.data.len();
        }
        let end = self.pos + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        self.dirty = true;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> ChanResult<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => self.data.len() as i64 + d,
        };
        if target < 0 {
            return Err(ChanError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            )));
        }
        self.pos = target as usize;
        Ok(self.pos as u64)
    }

    fn close(&mut self) -> ChanResult<()> {
        if !self.writable || !self.dirty {
            return Ok(());
        }
        let mut entries = self.entries.write();
        let data = std::mem::take(&mut self.data);
        let size = data.len() as u64;
        match entries.get_mut(&self.key) {
            Some(Entry::File { data: slot, attr }) => {
                *slot = data;
                attr.size = size;
                attr.mtime = SystemTime::now();
                Ok(())
            }
            // Removed while open; the data goes nowhere.
            _ => Ok(()),
        }
    }
}
