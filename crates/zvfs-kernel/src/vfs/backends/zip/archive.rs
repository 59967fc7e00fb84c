//! Mounted archives and their entries.
//!
//! An archive's bytes are mapped (or read onto the heap) once at mount and
//! never change. The directory is scanned into one [`ZipEntry`] per member
//! plus synthesized parent directories; entries carry their own lock
//! because writes replace an entry's payload in place.

use memmap2::Mmap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::crypt::{self, RotatedPassword};
use super::error::{ZipError, ZipResult};
use super::format::{
    self, CENTRAL_END_LEN, CENTRAL_HEADER_LEN, CENTRAL_HEADER_SIG, CRYPT_HEADER_LEN,
    CentralHeader, EndRecord, LOCAL_HEADER_LEN, LocalHeader, METHOD_DEFLATED, METHOD_STORED,
    PASSWORD_END_SIG,
};
use super::time;
use super::{VOLUME, count_slashes, map_path};
use crate::config::VfsConfig;
use crate::vfs::error::VfsResult;

// ============================================================================
// Backing bytes
// ============================================================================

/// An archive's bytes.
pub enum ArchiveBytes {
    /// Memory-mapped file.
    Mapped(Mmap),
    /// Heap copy.
    Heap(Vec<u8>),
}

impl Deref for ArchiveBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ArchiveBytes::Mapped(m) => m,
            ArchiveBytes::Heap(v) => v,
        }
    }
}

impl std::fmt::Debug for ArchiveBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            ArchiveBytes::Mapped(_) => "mapped",
            ArchiveBytes::Heap(_) => "heap",
        };
        write!(f, "ArchiveBytes({kind}, {} bytes)", self.len())
    }
}

impl ArchiveBytes {
    /// Map `path`, or read it onto the heap when mapping is off or fails.
    pub fn open(path: &Path, config: &VfsConfig) -> VfsResult<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < CENTRAL_END_LEN as u64 {
            return Err(ZipError::TruncatedFile.into());
        }
        if config.use_mmap {
            // SAFETY: the map is read-only and private; archives are not
            // expected to change underneath a mount.
            match unsafe { Mmap::map(&file) } {
                Ok(map) => return Ok(ArchiveBytes::Mapped(map)),
                Err(e) => tracing::warn!("mmap of {} failed, reading instead: {}", path.display(), e),
            }
        }
        Self::check_heap_size(len, config.heap_read_limit)?;
        let mut data = try_buffer(len as usize)?;
        file.read_to_end(&mut data)?;
        Ok(ArchiveBytes::Heap(data))
    }

    /// Adopt an in-memory buffer, subject to the heap limit.
    pub fn from_vec(data: Vec<u8>, config: &VfsConfig) -> ZipResult<Self> {
        Self::check_heap_size(data.len() as u64, config.heap_read_limit)?;
        Ok(ArchiveBytes::Heap(data))
    }

    fn check_heap_size(len: u64, limit: u64) -> ZipResult<()> {
        let end = CENTRAL_END_LEN as u64;
        if len <= end || len - end > limit.saturating_sub(end) {
            return Err(ZipError::IllegalFileSize);
        }
        Ok(())
    }
}

// ============================================================================
// Table of contents
// ============================================================================

/// Where the pieces of an archive sit in its file.
#[derive(Debug, Default)]
pub struct Toc {
    /// Start of the ZIP data (end of any executable prefix).
    pub base_offset: usize,
    /// Start of the password blob, or of the ZIP data when there is none.
    pub pass_offset: usize,
    /// Start of the central directory.
    pub directory_offset: usize,
    /// Central directory size.
    pub directory_size: usize,
    /// Entry count from the end record.
    pub num_files: usize,
    /// Password blob found in front of the data.
    pub password: Option<RotatedPassword>,
}

impl Toc {
    fn not_an_archive(len: usize) -> Self {
        Toc {
            base_offset: len,
            pass_offset: len,
            directory_offset: len,
            ..Default::default()
        }
    }
}

/// Locate and validate the central directory.
///
/// With `need_zip` false, data that isn't an archive yields a TOC whose
/// offsets all point at the end of the data, which is what image building
/// wants for a plain executable.
pub fn find_toc(data: &[u8], need_zip: bool) -> ZipResult<Toc> {
    let len = data.len();
    let Some(eocd) = format::find_end_record(data) else {
        return if need_zip {
            Err(ZipError::EndSignatureNotFound)
        } else {
            Ok(Toc::not_an_archive(len))
        };
    };
    let end = EndRecord::parse(data, eocd);
    if end.entries == 0 {
        return if need_zip {
            Err(ZipError::EmptyArchive)
        } else {
            Ok(Toc::not_an_archive(len))
        };
    }

    let cdir_offset = end.directory_offset as usize;
    let cdir_size = end.directory_size as usize;
    if !(cdir_offset <= eocd && cdir_size <= eocd - cdir_offset) {
        return if need_zip {
            Err(ZipError::DirectoryOverlapsEnd)
        } else {
            Ok(Toc::not_an_archive(len))
        };
    }

    let base_offset = (eocd - cdir_size).saturating_sub(cdir_offset);
    let cdir_start = eocd - cdir_size;
    let mut toc = Toc {
        base_offset,
        pass_offset: base_offset,
        directory_offset: cdir_offset + base_offset,
        directory_size: cdir_size,
        num_files: end.entries as usize,
        password: None,
    };

    let mut at = cdir_start;
    let mut min_local = len;
    for _ in 0..toc.num_files {
        if at - cdir_start + CENTRAL_HEADER_LEN > cdir_size {
            return Err(ZipError::TruncatedDirectory);
        }
        if format::read_u32(data, at) != CENTRAL_HEADER_SIG {
            return Err(ZipError::WrongHeaderSignature);
        }
        let central = CentralHeader::parse(data, at);
        let local_off = central.local_offset as usize;
        let local_at = base_offset + local_off;
        if local_at + LOCAL_HEADER_LEN > cdir_start || LocalHeader::parse(data, local_at).is_none()
        {
            return Err(ZipError::LocalHeaderNotFound);
        }
        min_local = min_local.min(local_off);
        at += central.record_len();
    }
    if at - cdir_start < cdir_size {
        return Err(ZipError::ShortFileCount);
    }

    toc.pass_offset = min_local + base_offset;
    let q = toc.pass_offset;
    if q >= 6 && format::read_u32(data, q - 4) == PASSWORD_END_SIG {
        let pw_len = data[q - 5] as usize;
        if let Some(start) = (q - 5).checked_sub(pw_len) {
            toc.password = Some(RotatedPassword::from_rotated(&data[start..q - 5]));
            if pw_len > 0 {
                toc.pass_offset -= 5 + pw_len;
            }
        }
    }
    Ok(toc)
}

// ============================================================================
// Archive
// ============================================================================

/// A mounted archive.
#[derive(Debug)]
pub struct ZipArchive {
    name: String,
    mount_point: String,
    bytes: ArchiveBytes,
    base_offset: usize,
    pass_offset: usize,
    password: Option<RotatedPassword>,
    top_dirs: Vec<String>,
    num_open: AtomicUsize,
}

impl ZipArchive {
    /// Archive file name ("Memory Buffer" for in-memory mounts).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized mount point.
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    /// All bytes, prefix included.
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of any executable prefix.
    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// End of the prefix proper, before any password blob.
    pub fn pass_offset(&self) -> usize {
        self.pass_offset
    }

    /// Rotated password, from the blob or the mount call.
    pub fn password(&self) -> Option<&RotatedPassword> {
        self.password.as_ref()
    }

    /// True when mounted at the filesystem root.
    pub fn is_root_mount(&self) -> bool {
        self.mount_point == "/"
    }

    /// Top-level directories of a root mount.
    pub fn top_dirs(&self) -> &[String] {
        &self.top_dirs
    }

    /// Open channels on this archive.
    pub fn num_open(&self) -> usize {
        self.num_open.load(Ordering::Acquire)
    }

    pub(crate) fn opened(&self) {
        self.num_open.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn closed(&self) {
        self.num_open.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Entries
// ============================================================================

/// What an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory, listed or synthesized.
    Directory,
    /// Mount point of an archive with an executable prefix; reading it
    /// yields the prefix.
    RootMarker,
}

impl EntryKind {
    /// Directories and root markers.
    pub fn is_dir(self) -> bool {
        !matches!(self, EntryKind::File)
    }
}

/// Mutable part of an entry.
#[derive(Debug, Clone)]
pub struct EntryState {
    pub kind: EntryKind,
    /// Payload offset in the archive bytes (start of the crypt header when
    /// encrypted).
    pub offset: usize,
    pub compressed_size: u64,
    pub size: u64,
    pub crc: u32,
    pub mtime: i64,
    /// DOS time field as recorded, for the crypt header check.
    pub dos_time: u16,
    pub method: u16,
    pub encrypted: bool,
    /// Content written through a channel; replaces the archive payload.
    pub data: Option<Arc<[u8]>>,
    /// Result of the one-time CRC comparison.
    pub crc_checked: Option<bool>,
}

impl EntryState {
    fn directory(offset: usize, mtime: i64) -> Self {
        Self {
            kind: EntryKind::Directory,
            offset,
            compressed_size: 0,
            size: 0,
            crc: 0,
            mtime,
            dos_time: 0,
            method: METHOD_STORED,
            encrypted: false,
            data: None,
            crc_checked: None,
        }
    }
}

/// One member of a mounted archive.
#[derive(Debug)]
pub struct ZipEntry {
    name: String,
    archive: Arc<ZipArchive>,
    depth: usize,
    is_volume: bool,
    state: Mutex<EntryState>,
}

impl ZipEntry {
    /// Full normalized name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning archive.
    pub fn archive(&self) -> &Arc<ZipArchive> {
        &self.archive
    }

    /// Number of `/` in the name.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The `//zipfs:/` volume root itself.
    pub fn is_volume(&self) -> bool {
        self.is_volume
    }

    /// Snapshot of the mutable state.
    pub fn state(&self) -> EntryState {
        self.state.lock().clone()
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, EntryState> {
        self.state.lock()
    }
}

/// Decode an entry's archive payload: decrypt, inflate and size-check.
/// Stored unencrypted payloads are returned as a range instead.
pub(crate) enum Decoded {
    Range(usize, usize),
    Owned(Vec<u8>),
}

pub(crate) fn decode_payload(archive: &ZipArchive, st: &EntryState) -> ZipResult<Decoded> {
    let data = archive.data();
    let size = st.size as usize;
    let mut start = st.offset;
    let mut payload_len = st.compressed_size as usize;
    if start.checked_add(payload_len).is_none_or(|end| end > data.len()) {
        return Err(ZipError::FileSizeError);
    }

    let mut keys = None;
    if st.encrypted {
        let password = archive.password().ok_or(ZipError::NoPassword)?;
        keys = Some(crypt::open_header(
            password,
            &data[start..start + payload_len],
            st.dos_time,
            st.crc,
        )?);
        start += CRYPT_HEADER_LEN;
        payload_len -= CRYPT_HEADER_LEN;
    }
    let raw = &data[start..start + payload_len];

    match (st.method, keys) {
        (METHOD_STORED, None) => {
            if payload_len < size {
                return Err(ZipError::Decompression);
            }
            Ok(Decoded::Range(start, size))
        }
        (METHOD_STORED, Some(mut keys)) => {
            if payload_len != size {
                return Err(ZipError::Decompression);
            }
            Ok(Decoded::Owned(keys.decode_all(raw)))
        }
        (METHOD_DEFLATED, keys) => {
            let mut plain_in;
            let input: &[u8] = match keys {
                Some(mut keys) => {
                    plain_in = keys.decode_all(raw);
                    &plain_in
                }
                None => {
                    plain_in = Vec::new();
                    raw
                }
            };
            let out = inflate(input, size);
            plain_in.fill(0);
            out.map(Decoded::Owned)
        }
        (method, _) => Err(ZipError::UnsupportedCompression(method)),
    }
}

/// Deflate can't expand input by more than this factor.
const MAX_DEFLATE_RATIO: usize = 1032;

/// An empty buffer with room for `size` bytes, or `OutOfMemory`.
pub(crate) fn try_buffer(size: usize) -> ZipResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size).map_err(|_| ZipError::OutOfMemory)?;
    Ok(buf)
}

fn inflate(input: &[u8], size: usize) -> ZipResult<Vec<u8>> {
    // The header's size is untrusted; never reserve more than the input
    // could possibly inflate to.
    let mut out = try_buffer(size.min(input.len().saturating_mul(MAX_DEFLATE_RATIO)))?;
    let decoder = flate2::read::DeflateDecoder::new(input);
    decoder
        .take(size as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|_| ZipError::Decompression)?;
    if out.len() != size {
        return Err(ZipError::Decompression);
    }
    Ok(out)
}

// ============================================================================
// Catalog
// ============================================================================

/// A freshly scanned archive, ready to be published.
pub struct Catalog {
    pub archive: Arc<ZipArchive>,
    pub entries: Vec<Arc<ZipEntry>>,
}

/// Scan the directory of `bytes` into entries under `mount_point`.
///
/// Names for which `taken` returns true (already provided by another mount)
/// are skipped, as are duplicates within the archive.
pub fn catalog(
    name: String,
    mount_point: &str,
    bytes: ArchiveBytes,
    toc: Toc,
    password: Option<&[u8]>,
    taken: impl Fn(&str) -> bool,
) -> ZipResult<Catalog> {
    let len = bytes.len();
    if toc.base_offset >= len || toc.pass_offset >= len || toc.directory_offset >= len {
        return Err(ZipError::BadZipData);
    }
    let root_mount = mount_point == "/";
    let now = chrono::Utc::now().timestamp();

    let mut pending: Vec<(String, EntryState)> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let claim = |name: &str, seen: &mut HashSet<String>| -> bool {
        !taken(name) && seen.insert(name.to_string())
    };

    if !root_mount && claim(mount_point, &mut seen) {
        let mut st = EntryState::directory(toc.base_offset, now);
        if toc.base_offset != 0 {
            st.kind = EntryKind::RootMarker;
        }
        pending.push((mount_point.to_string(), st));
    }

    let data: &[u8] = &bytes;
    let mut at = toc.directory_offset;
    let mut top_dirs = Vec::new();
    for _ in 0..toc.num_files {
        let central = CentralHeader::parse(data, at);
        let record_len = central.record_len();
        let name_start = at + CENTRAL_HEADER_LEN;
        let raw_name = data
            .get(name_start..name_start + central.name_len as usize)
            .unwrap_or_default();
        at += record_len;

        let mut path = decode_name(raw_name);
        let is_dir = path.ends_with('/');
        if is_dir {
            path.pop();
        }
        if path == "." || path == ".." {
            continue;
        }

        let local_at = toc.base_offset + central.local_offset as usize;
        let Some(local) = LocalHeader::parse(data, local_at) else {
            continue;
        };
        let streamed = !is_dir && local.is_streamed();
        let compressed_size = if streamed {
            central.compressed_size
        } else {
            local.compressed_size
        } as usize;
        let offset = local_at + local.payload_offset();
        if offset + compressed_size > len {
            continue;
        }
        if !is_dir && root_mount && count_slashes(&path) == 0 {
            continue;
        }

        let full = map_path(mount_point, &path);
        let (crc, dos_date, dos_time, size, method) = if streamed {
            (
                central.crc,
                central.dos_date,
                central.dos_time,
                central.size,
                central.method,
            )
        } else {
            (
                local.crc,
                local.dos_date,
                local.dos_time,
                local.size,
                local.method,
            )
        };
        if !claim(&full, &mut seen) {
            continue;
        }
        let depth = count_slashes(&full);
        let mtime = time::dos_to_unix(dos_date, dos_time);
        if is_dir && root_mount && depth == 1 {
            top_dirs.push(full.clone());
        }
        pending.push((
            full.clone(),
            EntryState {
                kind: if is_dir {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                offset,
                compressed_size: compressed_size as u64,
                size: size as u64,
                crc,
                mtime,
                dos_time,
                method,
                encrypted: local.flags & format::FLAG_ENCRYPTED != 0,
                data: None,
                crc_checked: None,
            },
        ));

        // Archives don't reliably list their directories.
        if depth > 1 {
            let mut dir = full.as_str();
            while let Some(i) = dir.rfind('/') {
                if i == 0 {
                    break;
                }
                dir = &dir[..i];
                if dir.len() < VOLUME.len() && dir.starts_with("//") {
                    break;
                }
                if !claim(dir, &mut seen) {
                    break;
                }
                if root_mount && count_slashes(dir) == 1 {
                    top_dirs.push(dir.to_string());
                }
                pending.push((dir.to_string(), EntryState::directory(offset, mtime)));
            }
        }
    }

    let password = toc.password.or_else(|| password.map(RotatedPassword::from_plain));
    let archive = Arc::new(ZipArchive {
        name,
        mount_point: mount_point.to_string(),
        bytes,
        base_offset: toc.base_offset,
        pass_offset: toc.pass_offset,
        password,
        top_dirs,
        num_open: AtomicUsize::new(0),
    });
    let entries = pending
        .into_iter()
        .map(|(name, state)| {
            Arc::new(ZipEntry {
                depth: count_slashes(&name),
                is_volume: name == VOLUME,
                name,
                archive: Arc::clone(&archive),
                state: Mutex::new(state),
            })
        })
        .collect();
    Ok(Catalog { archive, entries })
}

/// Entry names are UTF-8 in practice; anything else is taken as Latin-1.
fn decode_name(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::backends::zip::mkzip::encode_archive;

    fn sample() -> Vec<u8> {
        encode_archive(
            &[
                ("top.txt", b"top".as_slice()),
                ("lib/a.txt", b"aaaa".as_slice()),
                ("lib/deep/b.txt", b"bbbb".as_slice()),
            ],
            None,
        )
        .unwrap()
    }

    fn names(cat: &Catalog) -> Vec<String> {
        let mut v: Vec<String> = cat.entries.iter().map(|e| e.name().to_string()).collect();
        v.sort();
        v
    }

    #[test]
    fn test_unallocatable_buffer_is_out_of_memory() {
        assert_eq!(try_buffer(usize::MAX), Err(ZipError::OutOfMemory));
        assert!(try_buffer(16).unwrap().capacity() >= 16);
    }

    #[test]
    fn test_find_toc_plain() {
        let data = sample();
        let toc = find_toc(&data, true).unwrap();
        assert_eq!(toc.base_offset, 0);
        assert_eq!(toc.pass_offset, 0);
        assert_eq!(toc.num_files, 3);
        assert!(toc.password.is_none());
    }

    #[test]
    fn test_find_toc_with_prefix_and_blob() {
        let prefix = b"#!/bin/sh\nexit 0\n".to_vec();
        let blob = RotatedPassword::from_plain(b"pw").blob();
        let mut data = prefix.clone();
        data.extend_from_slice(&blob);
        let base = data.len();
        data.extend_from_slice(&sample());

        let toc = find_toc(&data, true).unwrap();
        assert_eq!(toc.base_offset, base);
        assert_eq!(toc.pass_offset, prefix.len());
        assert_eq!(toc.password.unwrap().derive(), b"pw".to_vec());
    }

    #[test]
    fn test_find_toc_errors() {
        assert_eq!(
            find_toc(b"definitely not a zip archive", true).unwrap_err(),
            ZipError::EndSignatureNotFound
        );
        let toc = find_toc(b"definitely not a zip archive", false).unwrap();
        assert_eq!(toc.pass_offset, 28);

        let mut data = sample();
        let eocd = format::find_end_record(&data).unwrap();
        let cdir_start = eocd - format::read_u32(&data, eocd + 12) as usize;
        data[cdir_start] = 0;
        assert_eq!(
            find_toc(&data, true).unwrap_err(),
            ZipError::WrongHeaderSignature
        );
    }

    #[test]
    fn test_catalog_synthesizes_parents() {
        let data = sample();
        let toc = find_toc(&data, true).unwrap();
        let cat = catalog(
            "t.zip".into(),
            "//zipfs:/app",
            ArchiveBytes::Heap(data),
            toc,
            None,
            |_| false,
        )
        .unwrap();
        assert_eq!(
            names(&cat),
            vec![
                "//zipfs:/app",
                "//zipfs:/app/lib",
                "//zipfs:/app/lib/a.txt",
                "//zipfs:/app/lib/deep",
                "//zipfs:/app/lib/deep/b.txt",
                "//zipfs:/app/top.txt",
            ]
        );
        let root = cat.entries.iter().find(|e| e.name() == "//zipfs:/app").unwrap();
        assert_eq!(root.state().kind, EntryKind::Directory);
        assert_eq!(root.depth(), 3);
    }

    #[test]
    fn test_root_mount_skips_top_level_files() {
        let data = sample();
        let toc = find_toc(&data, true).unwrap();
        let cat = catalog("t.zip".into(), "/", ArchiveBytes::Heap(data), toc, None, |_| false)
            .unwrap();
        assert_eq!(
            names(&cat),
            vec!["/lib", "/lib/a.txt", "/lib/deep", "/lib/deep/b.txt"]
        );
        assert_eq!(cat.archive.top_dirs(), &["/lib".to_string()]);
    }

    #[test]
    fn test_taken_names_are_skipped() {
        let data = sample();
        let toc = find_toc(&data, true).unwrap();
        let cat = catalog(
            "t.zip".into(),
            "/m",
            ArchiveBytes::Heap(data),
            toc,
            None,
            |n| n == "/m/top.txt",
        )
        .unwrap();
        assert!(!names(&cat).contains(&"/m/top.txt".to_string()));
    }

    #[test]
    fn test_heap_limit() {
        let config = VfsConfig {
            heap_read_limit: 64,
            ..Default::default()
        };
        assert_eq!(
            ArchiveBytes::from_vec(vec![0; 100], &config).unwrap_err(),
            ZipError::IllegalFileSize
        );
        assert!(ArchiveBytes::from_vec(vec![0; 40], &config).is_ok());
        assert!(ArchiveBytes::from_vec(vec![0; 10], &config).is_err());
    }
}
