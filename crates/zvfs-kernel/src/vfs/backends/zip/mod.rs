//! ZIP archive backend.
//!
//! Archives are mounted read-mostly: under an absolute path such as
//! `/zvfs`, under the `//zipfs:/` volume, or at `/` (top-level directories
//! only). Entries can be rewritten through write channels up to
//! [`VfsConfig::max_write_size`]; the new content lives in memory and the
//! archive file itself is never modified.
//!
//! ```no_run
//! use zvfs_kernel::vfs::backends::zip::ZipFs;
//! use zvfs_kernel::vfs::Filesystem;
//!
//! let fs = ZipFs::new();
//! fs.mount("app.zip", "/app", None)?;
//! let attr = fs.stat("/app/main.tcl")?;
//! # Ok::<(), zvfs_kernel::vfs::VfsError>(())
//! ```

mod archive;
mod channel;
pub mod crypt;
mod error;
pub mod format;
mod mkzip;
pub mod time;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use archive::{ArchiveBytes, EntryKind, EntryState, Toc, ZipArchive, ZipEntry, find_toc};
pub use error::{ZipError, ZipResult};
pub use mkzip::{ZipBuilder, encode_archive};

use archive::{Decoded, catalog, decode_payload, try_buffer};
use channel::{Source, ZipDriver};

use crate::chan::{ChanMode, Channel};
use crate::config::VfsConfig;
use crate::vfs::drain::DrainLock;
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::filesystem::{Filesystem, LoadTarget};
use crate::vfs::path::normalize_lexical;
use crate::vfs::pattern;
use crate::vfs::registry::EpochCounter;
use crate::vfs::types::{AccessMode, FileAttr, GlobTypes, OpenFlags};

/// Root of the archive volume.
pub const VOLUME: &str = "//zipfs:/";

/// Every entry reports this mode.
const ENTRY_PERM: u32 = 0o555;

const ATTRIBUTES: [&str; 7] = [
    "-uncompsize",
    "-compsize",
    "-offset",
    "-mount",
    "-archive",
    "-permissions",
    "-crc",
];

static NEXT_ZIP_CHANNEL: AtomicU64 = AtomicU64::new(0);

/// Number of `/` in a normalized name.
pub(crate) fn count_slashes(name: &str) -> usize {
    name.bytes().filter(|&b| b == b'/').count()
}

/// Name under which an archive file is recorded.
pub(crate) fn archive_key(path: &Path) -> String {
    dunce::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

/// Normalize a mount point argument.
///
/// Empty means the volume root, `/` the filesystem root. Other absolute
/// paths are used as given, relative ones are placed under the volume.
/// Foreign `//host` volumes and drive letters are rejected.
pub fn normalize_mount_point(mount_point: &str) -> ZipResult<String> {
    let mp = mount_point.replace('\\', "/");
    let bytes = mp.as_bytes();
    if mp.is_empty() {
        return Ok(VOLUME.to_string());
    }
    if mp.starts_with(&VOLUME[..VOLUME.len() - 1]) {
        return Ok(normalize_lexical(&mp));
    }
    if mp.starts_with("//") || (bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic())
    {
        return Err(ZipError::InvalidMountPath(mount_point.to_string()));
    }
    if mp.starts_with('/') {
        return Ok(normalize_lexical(&mp));
    }
    Ok(normalize_lexical(&format!("{VOLUME}{mp}")))
}

/// Map an archive member name (or any path) below `mount_point`.
///
/// Drive letters and `//host/share` prefixes are dropped, as are leading
/// separators; names already inside the volume are only normalized.
pub fn map_path(mount_point: &str, path: &str) -> String {
    let mut p = path.replace('\\', "/");
    if p.starts_with(VOLUME) {
        return normalize_lexical(&p);
    }
    let bytes = p.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        p.drain(..2);
    }
    if let Some(rest) = p.strip_prefix("//") {
        // Skip host and share.
        let mut parts = rest.splitn(3, '/');
        parts.next();
        parts.next();
        p = parts.next().unwrap_or("").to_string();
    }
    let rel = p.trim_start_matches('/');
    let joined = if mount_point.ends_with('/') {
        format!("{mount_point}{rel}")
    } else {
        format!("{mount_point}/{rel}")
    };
    normalize_lexical(&joined)
}

/// Filter for [`ZipFs::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListFilter {
    /// Glob over the full entry name.
    Glob(String),
    /// Unanchored regular expression over the full entry name.
    Regexp(String),
}

/// Where an entry lives inside its archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    /// Archive file name.
    pub archive: String,
    /// Uncompressed size.
    pub size: u64,
    /// Stored size, crypt header included.
    pub compressed_size: u64,
    /// Payload offset in the archive file.
    pub offset: u64,
}

#[derive(Debug, Clone, Default)]
struct ZipTable {
    /// Mount point to archive, in mount order.
    archives: IndexMap<String, Arc<ZipArchive>>,
    /// Full normalized name to entry.
    entries: HashMap<String, Arc<ZipEntry>>,
}

impl ZipTable {
    /// Names that stand for a mount in directory listings: the mount point,
    /// or the top-level directories of a root mount.
    fn mount_names(&self) -> impl Iterator<Item = &str> {
        self.archives.values().flat_map(|a| {
            let names: Vec<&str> = if a.is_root_mount() {
                a.top_dirs().iter().map(String::as_str).collect()
            } else {
                vec![a.mount_point()]
            };
            names
        })
    }

    /// Whether `path` is an ancestor of (or equal to) a mount.
    fn contains_mount_point(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        self.mount_names().any(|mp| match mp.strip_prefix(path) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || path.ends_with('/'),
            None => false,
        })
    }

    fn under_mount(&self, path: &str) -> bool {
        self.mount_names().any(|mp| match path.strip_prefix(mp) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        })
    }
}

/// The archive filesystem.
pub struct ZipFs {
    table: DrainLock<ZipTable>,
    config: VfsConfig,
    max_write: AtomicU64,
    epochs: Mutex<Vec<EpochCounter>>,
}

impl std::fmt::Debug for ZipFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipFs")
            .field("mounts", &self.mounts())
            .field("max_write", &self.max_write_size())
            .finish()
    }
}

impl Default for ZipFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipFs {
    /// Backend with the default configuration.
    pub fn new() -> Self {
        Self::with_config(VfsConfig::default())
    }

    /// Backend with an explicit configuration.
    pub fn with_config(config: VfsConfig) -> Self {
        Self {
            table: DrainLock::new(ZipTable::default()),
            max_write: AtomicU64::new(config.max_write_size),
            config,
            epochs: Mutex::new(Vec::new()),
        }
    }

    /// Current write cap. Zero means writes are refused.
    pub fn max_write_size(&self) -> u64 {
        self.max_write.load(Ordering::Acquire)
    }

    /// Change the write cap for channels opened from now on.
    pub fn set_max_write_size(&self, size: u64) {
        self.max_write.store(size, Ordering::Release);
    }

    fn notify(&self) {
        for epoch in self.epochs.lock().iter() {
            epoch.bump();
        }
    }

    // ========================================================================
    // Mounting
    // ========================================================================

    /// Mount the archive file at `archive` on `mount_point`.
    ///
    /// `password` is used for encrypted members when the archive carries no
    /// password blob of its own. Returns the normalized mount point.
    pub fn mount(
        &self,
        archive: impl AsRef<Path>,
        mount_point: &str,
        password: Option<&[u8]>,
    ) -> VfsResult<String> {
        let mp = normalize_mount_point(mount_point)?;
        let password = password.filter(|p| !p.is_empty());
        if let Some(pw) = password {
            crypt::validate_password(pw)?;
        }
        self.check_free(&mp)?;

        let path = archive.as_ref();
        let name = archive_key(path);
        let bytes = ArchiveBytes::open(path, &self.config)?;
        let toc = find_toc(&bytes, true)?;
        self.install(name, &mp, bytes, toc, password)?;
        Ok(mp)
    }

    /// Mount an archive held in memory.
    pub fn mount_data(&self, data: Vec<u8>, mount_point: &str) -> VfsResult<String> {
        let mp = normalize_mount_point(mount_point)?;
        self.check_free(&mp)?;
        let bytes = ArchiveBytes::from_vec(data, &self.config)?;
        let toc = find_toc(&bytes, true)?;
        self.install("Memory Buffer".to_string(), &mp, bytes, toc, None)?;
        Ok(mp)
    }

    fn check_free(&self, mp: &str) -> ZipResult<()> {
        match self.table.read().archives.get(mp) {
            Some(existing) => Err(ZipError::AlreadyMounted {
                archive: existing.name().to_string(),
                mount_point: mp.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn install(
        &self,
        name: String,
        mp: &str,
        bytes: ArchiveBytes,
        toc: Toc,
        password: Option<&[u8]>,
    ) -> VfsResult<()> {
        let count = self.table.write(|t| -> ZipResult<usize> {
            if let Some(existing) = t.archives.get(mp) {
                return Err(ZipError::AlreadyMounted {
                    archive: existing.name().to_string(),
                    mount_point: mp.to_string(),
                });
            }
            let cat = catalog(name, mp, bytes, toc, password, |n| t.entries.contains_key(n))?;
            let count = cat.entries.len();
            for entry in cat.entries {
                t.entries.insert(entry.name().to_string(), entry);
            }
            t.archives.insert(mp.to_string(), cat.archive);
            Ok(count)
        })?;
        tracing::debug!("mounted {} ({} entries)", mp, count);
        self.notify();
        Ok(())
    }

    /// Unmount whatever is mounted on `mount_point`. Unknown mount points
    /// are ignored; an archive with open channels is busy.
    pub fn unmount(&self, mount_point: &str) -> VfsResult<()> {
        let mp = normalize_mount_point(mount_point)?;
        let removed = self.table.write(|t| -> VfsResult<Option<Arc<ZipArchive>>> {
            match t.archives.get(&mp) {
                None => return Ok(None),
                Some(a) if a.num_open() > 0 => return Err(VfsError::Busy),
                Some(_) => {}
            }
            let archive = t.archives.shift_remove(&mp);
            if let Some(a) = &archive {
                t.entries.retain(|_, e| !Arc::ptr_eq(e.archive(), a));
            }
            Ok(archive)
        })?;
        if let Some(archive) = removed {
            tracing::debug!("unmounted {} from {}", archive.name(), mp);
            self.notify();
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// `(mount point, archive name)` pairs in mount order.
    pub fn mounts(&self) -> Vec<(String, String)> {
        self.table
            .read()
            .archives
            .iter()
            .map(|(mp, a)| (mp.clone(), a.name().to_string()))
            .collect()
    }

    /// Archive mounted on `mount_point`.
    pub fn mount_info(&self, mount_point: &str) -> Option<String> {
        let mp = normalize_mount_point(mount_point).ok()?;
        self.table.read().archives.get(&mp).map(|a| a.name().to_string())
    }

    /// Mounted archive recorded under `name`.
    pub fn archive_named(&self, name: &str) -> Option<Arc<ZipArchive>> {
        self.table
            .read()
            .archives
            .values()
            .find(|a| a.name() == name)
            .cloned()
    }

    /// Whether `path` is an entry of a mounted archive.
    pub fn exists(&self, path: &str) -> bool {
        self.table.read().entries.contains_key(&Self::lookup_key(path))
    }

    /// Location of an entry inside its archive.
    pub fn info(&self, path: &str) -> VfsResult<EntryInfo> {
        let table = self.table.read();
        let entry = table
            .entries
            .get(&Self::lookup_key(path))
            .ok_or_else(|| ZipError::NotInVolume(path.to_string()))?;
        let st = entry.state();
        Ok(EntryInfo {
            archive: entry.archive().name().to_string(),
            size: st.size,
            compressed_size: st.compressed_size,
            offset: st.offset as u64,
        })
    }

    /// Entry names, sorted, optionally filtered.
    pub fn list(&self, filter: Option<&ListFilter>) -> VfsResult<Vec<String>> {
        let keep: Box<dyn Fn(&str) -> bool> = match filter {
            None => Box::new(|_| true),
            Some(ListFilter::Glob(p)) => {
                let m = pattern::matcher(p)?;
                Box::new(move |n| m.is_match(n))
            }
            Some(ListFilter::Regexp(p)) => {
                let re = regex::Regex::new(p).map_err(|e| ZipError::BadPattern(e.to_string()))?;
                Box::new(move |n| re.is_match(n))
            }
        };
        let table = self.table.read();
        let mut names: Vec<String> = table
            .entries
            .keys()
            .filter(|n| keep(n.as_str()))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    /// Where `path` would land when mounted on `mount_point` (the volume
    /// root by default).
    pub fn canonical(mount_point: Option<&str>, path: &str) -> VfsResult<String> {
        let mp = match mount_point {
            Some(mp) => normalize_mount_point(mp)?,
            None => VOLUME.to_string(),
        };
        Ok(map_path(&mp, path))
    }

    fn lookup_key(path: &str) -> String {
        if path.starts_with('/') {
            normalize_lexical(&path.replace('\\', "/"))
        } else {
            path.to_string()
        }
    }

    // ========================================================================
    // Channels
    // ========================================================================

    fn open_entry(&self, path: &str, flags: OpenFlags) -> VfsResult<(ZipDriver, usize)> {
        let max_write = self.max_write_size();
        if flags.write && max_write == 0 {
            return Err(ZipError::WritesNotPermitted.into());
        }
        if (flags.append || flags.truncate) && !flags.write {
            return Err(VfsError::invalid_argument(
                "append and truncate require write access",
            ));
        }

        let table = self.table.read();
        let Some(entry) = table.entries.get(path).cloned() else {
            return Err(if flags.write {
                ZipError::FileNotCreated(path.to_string()).into()
            } else {
                VfsError::not_found(path)
            });
        };
        let archive = Arc::clone(entry.archive());
        let mut st = entry.lock();
        let overridden = st.data.is_some();

        if !overridden && st.offset >= archive.data().len() {
            return Err(ZipError::FileSizeError.into());
        }
        if flags.write && st.kind.is_dir() {
            return Err(VfsError::is_a_directory(path));
        }
        if !overridden && !matches!(st.method, format::METHOD_STORED | format::METHOD_DEFLATED) {
            return Err(ZipError::UnsupportedCompression(st.method).into());
        }
        if flags.write && !flags.truncate && !overridden && st.size > max_write {
            return Err(ZipError::ExceedsMaxWritable.into());
        }
        if st.encrypted && !overridden {
            if st.compressed_size < format::CRYPT_HEADER_LEN as u64 {
                return Err(ZipError::TruncatedCryptHeader.into());
            }
            if archive.password().is_none() {
                return Err(ZipError::NoPassword.into());
            }
        }

        let offset = st.offset;
        let driver = if flags.write {
            let initial = if flags.truncate {
                st.crc = 0;
                st.crc_checked = None;
                Vec::new()
            } else if let Some(data) = &st.data {
                copy_out(data)?
            } else {
                let bytes = match decode_payload(&archive, &st)? {
                    Decoded::Range(start, len) => copy_out(&archive.data()[start..start + len])?,
                    Decoded::Owned(v) => v,
                };
                verify_crc(&mut st, &bytes)?;
                bytes
            };
            let cap = usize::try_from(max_write).unwrap_or(usize::MAX);
            ZipDriver::writer(Arc::clone(&entry), initial, cap, flags.append)
        } else {
            let (kind, shared) = (st.kind, st.data.clone());
            let (source, directory) = match (kind, shared) {
                (EntryKind::Directory, _) => (Source::Owned(Vec::new()), true),
                (EntryKind::RootMarker, _) => (
                    Source::Archive {
                        start: 0,
                        len: archive.base_offset(),
                    },
                    false,
                ),
                (EntryKind::File, Some(data)) => (Source::Shared(data), false),
                (EntryKind::File, None) => {
                    let source = match decode_payload(&archive, &st)? {
                        Decoded::Range(start, len) => {
                            verify_crc(&mut st, &archive.data()[start..start + len])?;
                            Source::Archive { start, len }
                        }
                        Decoded::Owned(v) => {
                            verify_crc(&mut st, &v)?;
                            Source::Owned(v)
                        }
                    };
                    (source, false)
                }
            };
            ZipDriver::reader(Arc::clone(&entry), source, directory)
        };
        drop(st);
        // Counted while the table guard is held so unmount can't slip in.
        archive.opened();
        drop(table);
        Ok((driver, offset))
    }
}

/// Copy existing content into a fresh write buffer.
fn copy_out(content: &[u8]) -> ZipResult<Vec<u8>> {
    let mut buf = try_buffer(content.len())?;
    buf.extend_from_slice(content);
    Ok(buf)
}

/// Compare the content against the recorded CRC once per entry.
fn verify_crc(st: &mut EntryState, content: &[u8]) -> ZipResult<()> {
    if st.crc == 0 {
        return Ok(());
    }
    let expected = st.crc;
    let ok = *st
        .crc_checked
        .get_or_insert_with(|| crc32fast::hash(content) == expected);
    if ok { Ok(()) } else { Err(ZipError::InvalidCrc) }
}

impl Filesystem for ZipFs {
    fn path_in_filesystem(&self, path: &str) -> bool {
        if path.starts_with(VOLUME) {
            return true;
        }
        let table = self.table.read();
        table.entries.contains_key(path) || table.under_mount(path)
    }

    fn registered(&self, epoch: EpochCounter) {
        self.epochs.lock().push(epoch);
    }

    fn list_volumes(&self) -> Vec<String> {
        vec![VOLUME.to_string()]
    }

    fn path_type(&self, _path: &str) -> VfsResult<String> {
        Ok("zip".to_string())
    }

    fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let table = self.table.read();
        if let Some(entry) = table.entries.get(path) {
            let st = entry.state();
            let mut attr = if st.kind.is_dir() {
                FileAttr::directory(ENTRY_PERM)
            } else {
                FileAttr::file(st.size, ENTRY_PERM)
            };
            attr.size = st.size;
            return Ok(attr.with_mtime_secs(st.mtime));
        }
        if table.contains_mount_point(path) {
            return Ok(FileAttr::directory(ENTRY_PERM));
        }
        Err(VfsError::not_found(path))
    }

    fn access(&self, path: &str, mode: AccessMode) -> VfsResult<()> {
        if mode.execute {
            return Err(VfsError::permission_denied(path));
        }
        let table = self.table.read();
        if let Some(entry) = table.entries.get(path) {
            if mode.write && entry.state().kind.is_dir() {
                return Err(VfsError::permission_denied(path));
            }
            return Ok(());
        }
        if table.contains_mount_point(path) {
            if mode.write {
                return Err(VfsError::permission_denied(path));
            }
            return Ok(());
        }
        Err(VfsError::not_found(path))
    }

    fn file_attr_strings(&self, _path: &str) -> VfsResult<Vec<String>> {
        Ok(ATTRIBUTES.iter().map(|s| s.to_string()).collect())
    }

    fn file_attr_get(&self, path: &str, index: usize) -> VfsResult<String> {
        if index >= ATTRIBUTES.len() {
            return Err(ZipError::UnknownAttribute.into());
        }
        let table = self.table.read();
        if let Some(entry) = table.entries.get(path) {
            let st = entry.state();
            let archive = entry.archive();
            return Ok(match index {
                0 => st.size.to_string(),
                1 => st.compressed_size.to_string(),
                2 => st.offset.to_string(),
                3 => archive.mount_point().to_string(),
                4 => archive.name().to_string(),
                5 => format!("0o{ENTRY_PERM:o}"),
                _ => st.crc.to_string(),
            });
        }
        if table.contains_mount_point(path) {
            return Ok(match index {
                3 | 4 => String::new(),
                5 => format!("0o{ENTRY_PERM:o}"),
                _ => "0".to_string(),
            });
        }
        Err(VfsError::not_found(path))
    }

    fn file_attr_set(&self, _path: &str, _index: usize, _value: &str) -> VfsResult<()> {
        Err(ZipError::UnsupportedOperation.into())
    }

    fn open(&self, path: &str, flags: OpenFlags, _perm: u32) -> VfsResult<Channel> {
        let (driver, offset) = self.open_entry(path, flags)?;
        let id = NEXT_ZIP_CHANNEL.fetch_add(1, Ordering::Relaxed);
        let mode = ChanMode {
            readable: flags.read,
            writable: flags.write,
        };
        Ok(Channel::new(
            format!("zipfs_{offset:x}_{id}"),
            mode,
            Box::new(driver),
        ))
    }

    fn match_in_directory(
        &self,
        dir: &str,
        pattern: Option<&str>,
        types: GlobTypes,
    ) -> VfsResult<Vec<String>> {
        if types.mounts && (types.dirs || types.files) {
            return Err(VfsError::invalid_argument(
                "mount enumeration can't be combined with other types",
            ));
        }
        let table = self.table.read();
        if types.mounts {
            return match_mounts(&table, dir, pattern.unwrap_or("*"));
        }
        if !types.dirs && !types.files {
            return Ok(Vec::new());
        }

        let Some(pattern) = pattern.filter(|p| !p.is_empty()) else {
            let found = match table.entries.get(dir) {
                Some(entry) => types.accepts(entry.state().kind.is_dir()),
                None => types.dirs && table.contains_mount_point(dir),
            };
            return Ok(if found { vec![dir.to_string()] } else { Vec::new() });
        };

        let mut prefix = dir.trim_end_matches('/').to_string();
        prefix.push('/');
        let depth = count_slashes(&prefix);
        let matcher = pattern::matcher(pattern)?;
        let wanted = |leaf: &str| matcher.is_match(leaf) && pattern::hidden_ok(leaf, pattern);

        let mut out = BTreeSet::new();
        for entry in table.entries.values() {
            if entry.is_volume() || entry.depth() != depth {
                continue;
            }
            let Some(leaf) = entry.name().strip_prefix(prefix.as_str()) else {
                continue;
            };
            if !leaf.is_empty() && types.accepts(entry.state().kind.is_dir()) && wanted(leaf) {
                out.insert(entry.name().to_string());
            }
        }
        if types.dirs {
            for mp in table.mount_names() {
                let Some(rest) = mp.strip_prefix(prefix.as_str()) else {
                    continue;
                };
                let leaf = rest.split('/').next().unwrap_or("");
                if !leaf.is_empty() && wanted(leaf) {
                    out.insert(format!("{prefix}{leaf}"));
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    fn load_file(&self, path: &str) -> VfsResult<LoadTarget> {
        let table = self.table.read();
        match table.entries.get(path) {
            Some(entry) if !entry.state().kind.is_dir() => Err(VfsError::CrossDevice),
            _ => Err(VfsError::not_found(path)),
        }
    }
}

/// Mount points exactly one level below `dir` whose last component
/// matches `pattern`.
fn match_mounts(table: &ZipTable, dir: &str, pattern: &str) -> VfsResult<Vec<String>> {
    let matcher = pattern::matcher(pattern)?;
    let (prefix, level) = match dir.strip_suffix('/') {
        Some(p) => (p, count_slashes(dir)),
        None => (dir, count_slashes(dir) + 1),
    };
    let mut out = BTreeSet::new();
    for name in table.mount_names() {
        let Some(rest) = name.strip_prefix(prefix) else {
            continue;
        };
        let Some(leaf) = rest.strip_prefix('/') else {
            continue;
        };
        if !leaf.is_empty() && count_slashes(name) == level && matcher.is_match(leaf) {
            out.insert(name.to_string());
        }
    }
    Ok(out.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn sample() -> Vec<u8> {
        encode_archive(
            &[
                ("main.txt", b"hello from main".as_slice()),
                ("lib/util.txt", b"utility".as_slice()),
                ("lib/big.txt", "zip ".repeat(500).as_bytes()),
            ],
            None,
        )
        .unwrap()
    }

    fn mounted(mp: &str) -> ZipFs {
        let fs = ZipFs::new();
        fs.mount_data(sample(), mp).unwrap();
        fs
    }

    fn read_all(fs: &ZipFs, path: &str) -> Vec<u8> {
        let mut chan = fs.open(path, OpenFlags::read(), 0).unwrap();
        let mut out = Vec::new();
        chan.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_mount_point_forms() {
        assert_eq!(normalize_mount_point("").unwrap(), "//zipfs:/");
        assert_eq!(normalize_mount_point("app").unwrap(), "//zipfs:/app");
        assert_eq!(normalize_mount_point("//zipfs:/a/../b/").unwrap(), "//zipfs:/b");
        assert_eq!(normalize_mount_point("/zvfs/").unwrap(), "/zvfs");
        assert_eq!(normalize_mount_point("/").unwrap(), "/");
        assert_eq!(normalize_mount_point("a\\b").unwrap(), "//zipfs:/a/b");
        assert!(normalize_mount_point("//server/share").is_err());
        assert!(normalize_mount_point("C:/x").is_err());
    }

    #[test]
    fn test_map_path() {
        assert_eq!(map_path("//zipfs:/", "a/b"), "//zipfs:/a/b");
        assert_eq!(map_path("/app", "/x/../y"), "/app/y");
        assert_eq!(map_path("/app", "C:/dir/f"), "/app/dir/f");
        assert_eq!(map_path("/app", "//host/share/f"), "/app/f");
        assert_eq!(map_path("/app", "//zipfs:/q"), "//zipfs:/q");
        assert_eq!(
            ZipFs::canonical(Some("m"), "sub/file").unwrap(),
            "//zipfs:/m/sub/file"
        );
        assert_eq!(ZipFs::canonical(None, "f").unwrap(), "//zipfs:/f");
    }

    #[test]
    fn test_read_stored_and_deflated() {
        let fs = mounted("/app");
        assert_eq!(read_all(&fs, "/app/main.txt"), b"hello from main");
        assert_eq!(read_all(&fs, "/app/lib/big.txt"), "zip ".repeat(500).into_bytes());
    }

    #[test]
    fn test_stat_and_access() {
        let fs = mounted("/app");
        let attr = fs.stat("/app/lib/util.txt").unwrap();
        assert!(attr.is_file());
        assert_eq!(attr.size, 7);
        assert_eq!(attr.perm, 0o555);
        assert!(fs.stat("/app/lib").unwrap().is_dir());
        assert!(fs.stat("/app/nope").unwrap_err().is_not_found());

        assert!(fs.access("/app/main.txt", AccessMode::READ).is_ok());
        assert!(fs.access("/app/main.txt", AccessMode::EXECUTE).is_err());
        assert!(fs.access("/app/lib", AccessMode::WRITE).is_err());
    }

    #[test]
    fn test_mount_ancestors_are_directories() {
        let fs = mounted("/opt/tools/app");
        assert!(fs.stat("/opt/tools").unwrap().is_dir());
        assert!(fs.access("/opt", AccessMode::READ).is_ok());
        assert!(fs.stat("/op").is_err());
        assert_eq!(fs.file_attr_get("/opt", 3).unwrap(), "");
        assert_eq!(fs.file_attr_get("/opt", 0).unwrap(), "0");
    }

    #[test]
    fn test_path_dispatch() {
        let fs = mounted("/app");
        assert!(fs.path_in_filesystem("/app"));
        assert!(fs.path_in_filesystem("/app/anything/below"));
        assert!(fs.path_in_filesystem("//zipfs:/whatever"));
        assert!(!fs.path_in_filesystem("/application"));
        assert!(!fs.path_in_filesystem("/"));
    }

    #[test]
    fn test_root_mount() {
        let fs = mounted("/");
        assert!(fs.path_in_filesystem("/lib/util.txt"));
        assert!(!fs.path_in_filesystem("/main.txt"));
        assert!(!fs.path_in_filesystem("/etc"));
        assert_eq!(
            fs.match_in_directory("/", Some("*"), GlobTypes::MOUNTS).unwrap(),
            vec!["/lib"]
        );
    }

    #[test]
    fn test_already_mounted() {
        let fs = mounted("/app");
        let err = fs.mount_data(sample(), "/app").unwrap_err();
        assert!(matches!(
            err,
            VfsError::Zip(ZipError::AlreadyMounted { .. })
        ));
        assert_eq!(err.to_string(), "Memory Buffer is already mounted on /app");
    }

    #[test]
    fn test_glob_one_level() {
        let fs = mounted("/app");
        let all = fs.match_in_directory("/app", Some("*"), GlobTypes::ANY).unwrap();
        assert_eq!(all, vec!["/app/lib", "/app/main.txt"]);
        let files = fs.match_in_directory("/app/lib", Some("*.txt"), GlobTypes::FILES).unwrap();
        assert_eq!(files, vec!["/app/lib/big.txt", "/app/lib/util.txt"]);
        let dirs = fs.match_in_directory("/app/", Some("*"), GlobTypes::DIRS).unwrap();
        assert_eq!(dirs, vec!["/app/lib"]);
        assert_eq!(
            fs.match_in_directory("/app/main.txt", None, GlobTypes::FILES).unwrap(),
            vec!["/app/main.txt"]
        );
        assert!(fs.match_in_directory("/app/main.txt", None, GlobTypes::DIRS).unwrap().is_empty());
    }

    #[test]
    fn test_glob_adds_mount_ancestors() {
        let fs = mounted("/opt/tools/app");
        let dirs = fs.match_in_directory("/opt", Some("*"), GlobTypes::DIRS).unwrap();
        assert_eq!(dirs, vec!["/opt/tools"]);
        let mounts = fs.match_in_directory("/opt/tools", None, GlobTypes::MOUNTS).unwrap();
        assert_eq!(mounts, vec!["/opt/tools/app"]);
        let bad = GlobTypes {
            dirs: true,
            files: false,
            mounts: true,
        };
        assert!(fs.match_in_directory("/opt", Some("*"), bad).is_err());
    }

    #[test]
    fn test_volume_listing_skips_volume_entry() {
        let fs = mounted("");
        let top = fs.match_in_directory("//zipfs:/", Some("*"), GlobTypes::ANY).unwrap();
        assert_eq!(top, vec!["//zipfs:/lib", "//zipfs:/main.txt"]);
    }

    #[test]
    fn test_write_then_read() {
        let fs = mounted("/app");
        let mut chan = fs
            .open("/app/main.txt", OpenFlags::write_truncate(), 0)
            .unwrap();
        chan.write_all(b"rewritten").unwrap();
        chan.close().unwrap();
        assert_eq!(read_all(&fs, "/app/main.txt"), b"rewritten");
        assert_eq!(fs.stat("/app/main.txt").unwrap().size, 9);

        let mut chan = fs.open("/app/main.txt", OpenFlags::append(), 0).unwrap();
        chan.write_all(b"!").unwrap();
        drop(chan);
        assert_eq!(read_all(&fs, "/app/main.txt"), b"rewritten!");
    }

    #[test]
    fn test_write_limits() {
        let fs = mounted("/app");
        fs.set_max_write_size(8);
        let mut chan = fs
            .open("/app/main.txt", OpenFlags::write_truncate(), 0)
            .unwrap();
        assert!(chan.write_some(b"123456789").is_err());
        assert_eq!(chan.write_some(b"12345678").unwrap(), 8);
        drop(chan);

        let err = fs.open("/app/lib/big.txt", OpenFlags::read_write(), 0).unwrap_err();
        assert!(matches!(err, VfsError::Zip(ZipError::ExceedsMaxWritable)));

        fs.set_max_write_size(0);
        let err = fs.open("/app/main.txt", OpenFlags::append(), 0).unwrap_err();
        assert!(matches!(err, VfsError::Zip(ZipError::WritesNotPermitted)));
    }

    #[test]
    fn test_open_errors() {
        let fs = mounted("/app");
        assert!(fs.open("/app/missing", OpenFlags::read(), 0).unwrap_err().is_not_found());
        let err = fs
            .open("/app/missing", OpenFlags::write_truncate(), 0)
            .unwrap_err();
        assert!(matches!(err, VfsError::Zip(ZipError::FileNotCreated(_))));
        let err = fs.open("/app/lib", OpenFlags::read_write(), 0).unwrap_err();
        assert!(matches!(err, VfsError::IsADirectory(_)));
        let flags = OpenFlags {
            truncate: true,
            ..OpenFlags::read()
        };
        assert!(matches!(
            fs.open("/app/main.txt", flags, 0).unwrap_err(),
            VfsError::InvalidArgument(_)
        ));

        let mut dir = fs.open("/app/lib", OpenFlags::read(), 0).unwrap();
        let mut buf = [0u8; 4];
        assert!(dir.read_some(&mut buf).is_err());
    }

    #[test]
    fn test_seek_bounds() {
        let fs = mounted("/app");
        let mut chan = fs.open("/app/main.txt", OpenFlags::read(), 0).unwrap();
        assert_eq!(chan.seek(SeekFrom::End(-4)).unwrap(), 11);
        let mut tail = String::new();
        chan.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "main");
        assert!(chan.seek(SeekFrom::Start(100)).is_err());
        assert!(chan.seek(SeekFrom::Current(-100)).is_err());

        let mut w = fs.open("/app/main.txt", OpenFlags::read_write(), 0).unwrap();
        assert_eq!(w.seek(SeekFrom::Start(20)).unwrap(), 20);
        w.write_all(b"x").unwrap();
        drop(w);
        let data = read_all(&fs, "/app/main.txt");
        assert_eq!(data.len(), 21);
        assert!(data.starts_with(b"hello from main"));
    }

    #[test]
    fn test_busy_unmount() {
        let fs = mounted("/app");
        let chan = fs.open("/app/main.txt", OpenFlags::read(), 0).unwrap();
        assert!(matches!(fs.unmount("/app").unwrap_err(), VfsError::Busy));
        drop(chan);
        fs.unmount("/app").unwrap();
        assert!(!fs.exists("/app/main.txt"));
        fs.unmount("/app").unwrap();
    }

    #[test]
    fn test_oversized_header_claim_fails_cleanly() {
        let text = "zip ".repeat(500);
        let mut data = encode_archive(&[("big.txt", text.as_bytes())], None).unwrap();
        let local = format::LocalHeader::parse(&data, 0).unwrap();
        assert_eq!(local.method, format::METHOD_DEFLATED);
        // Uncompressed size field of the local header.
        data[22..26].copy_from_slice(&0xffff_fff0u32.to_le_bytes());

        let fs = ZipFs::new();
        fs.mount_data(data, "/huge").unwrap();
        assert_eq!(fs.stat("/huge/big.txt").unwrap().size, 0xffff_fff0);
        let err = fs.open("/huge/big.txt", OpenFlags::read(), 0).unwrap_err();
        assert!(matches!(err, VfsError::Zip(ZipError::Decompression)));
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut data = sample();
        // Corrupt the stored payload of main.txt without touching headers.
        let local = format::LocalHeader::parse(&data, 0).unwrap();
        let at = local.payload_offset();
        data[at] ^= 0xff;
        let fs = ZipFs::new();
        fs.mount_data(data, "/bad").unwrap();
        let err = fs.open("/bad/main.txt", OpenFlags::read(), 0).unwrap_err();
        assert!(matches!(err, VfsError::Zip(ZipError::InvalidCrc)));
    }

    #[test]
    fn test_query_surface() {
        let fs = mounted("/app");
        assert_eq!(fs.mount_info("/app").as_deref(), Some("Memory Buffer"));
        assert!(fs.exists("/app/lib/../main.txt"));
        let info = fs.info("/app/lib/util.txt").unwrap();
        assert_eq!(info.size, 7);
        assert_eq!(info.archive, "Memory Buffer");
        assert!(matches!(
            fs.info("/elsewhere").unwrap_err(),
            VfsError::Zip(ZipError::NotInVolume(_))
        ));

        let txt = fs.list(Some(&ListFilter::Glob("/app/lib/*".into()))).unwrap();
        assert_eq!(txt, vec!["/app/lib/big.txt", "/app/lib/util.txt"]);
        let re = fs.list(Some(&ListFilter::Regexp("util".into()))).unwrap();
        assert_eq!(re, vec!["/app/lib/util.txt"]);
        assert!(fs.list(Some(&ListFilter::Regexp("(".into()))).is_err());
        assert_eq!(fs.list(None).unwrap().len(), 5);
    }

    #[test]
    fn test_attributes() {
        let fs = mounted("/app");
        let names = fs.file_attr_strings("/app/main.txt").unwrap();
        assert_eq!(names[0], "-uncompsize");
        assert_eq!(fs.file_attr_get("/app/main.txt", 0).unwrap(), "15");
        assert_eq!(fs.file_attr_get("/app/main.txt", 3).unwrap(), "/app");
        assert_eq!(fs.file_attr_get("/app/main.txt", 5).unwrap(), "0o555");
        assert!(fs.file_attr_get("/app/main.txt", 7).is_err());
        assert!(matches!(
            fs.file_attr_set("/app/main.txt", 0, "1").unwrap_err(),
            VfsError::Zip(ZipError::UnsupportedOperation)
        ));
        assert!(matches!(
            fs.load_file("/app/main.txt").unwrap_err(),
            VfsError::CrossDevice
        ));
    }

    #[test]
    fn test_root_marker_reads_prefix() {
        let mut data = b"#!stub\n".to_vec();
        data.extend_from_slice(&sample());
        let fs = ZipFs::new();
        fs.mount_data(data, "/sfx").unwrap();
        assert!(fs.stat("/sfx").unwrap().is_dir());
        assert_eq!(read_all(&fs, "/sfx"), b"#!stub\n");
        assert_eq!(read_all(&fs, "/sfx/main.txt"), b"hello from main");
    }

    #[test]
    fn test_short_encrypted_entry_is_corrupt() {
        let mut data = encode_archive(&[("tiny.txt", b"abc".as_slice())], None).unwrap();
        let local = format::LocalHeader::parse(&data, 0).unwrap();
        assert_eq!(local.compressed_size, 3);
        // General purpose flags of the local header.
        let flags = local.flags | format::FLAG_ENCRYPTED;
        data[6..8].copy_from_slice(&flags.to_le_bytes());

        let fs = ZipFs::new();
        fs.mount_data(data, "/short").unwrap();
        let err = fs.open("/short/tiny.txt", OpenFlags::read(), 0).unwrap_err();
        assert!(matches!(err, VfsError::Zip(ZipError::TruncatedCryptHeader)));
    }

    #[test]
    fn test_encrypted_empty_entry_is_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.zip");
        let data = encode_archive(
            &[("empty.txt", b"".as_slice()), ("full.txt", b"content".as_slice())],
            Some(b"pw".as_slice()),
        )
        .unwrap();
        let local = format::LocalHeader::parse(&data, 0).unwrap();
        assert_eq!(local.compressed_size as usize, format::CRYPT_HEADER_LEN);
        std::fs::write(&path, data).unwrap();

        let fs = ZipFs::new();
        fs.mount(&path, "/e", None).unwrap();
        let err = fs.open("/e/empty.txt", OpenFlags::read(), 0).unwrap_err();
        assert!(matches!(err, VfsError::Zip(ZipError::NoPassword)));
        fs.unmount("/e").unwrap();

        fs.mount(&path, "/e", Some(b"pw".as_slice())).unwrap();
        assert_eq!(read_all(&fs, "/e/empty.txt"), b"");
        assert_eq!(read_all(&fs, "/e/full.txt"), b"content");
    }

    #[test]
    fn test_mount_password_and_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.zip");
        let data = encode_archive(&[("s.txt", b"classified".as_slice())], Some(b"pw".as_slice())).unwrap();
        std::fs::write(&path, data).unwrap();

        let fs = ZipFs::new();
        let epoch = EpochCounter::default();
        fs.registered(epoch.clone());

        fs.mount(&path, "/nopw", None).unwrap();
        assert_eq!(epoch.get(), 1);
        let err = fs.open("/nopw/s.txt", OpenFlags::read(), 0).unwrap_err();
        assert!(matches!(err, VfsError::Zip(ZipError::NoPassword)));

        fs.mount(&path, "/pw", Some(b"pw".as_slice())).unwrap();
        assert_eq!(read_all(&fs, "/pw/s.txt"), b"classified");
        assert!(fs.mount(&path, "/x", Some([0xffu8].as_slice())).is_err());
        assert_eq!(fs.archive_named(&archive_key(&path)).unwrap().mount_point(), "/nopw");
    }
}
