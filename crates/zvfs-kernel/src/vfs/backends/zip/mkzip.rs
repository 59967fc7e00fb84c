//! Building archives and self-extracting images.
//!
//! Every member is deflated at level 9 and kept stored instead when that
//! doesn't save anything. Payloads start on a 4-byte boundary so a mapped
//! archive can be read in place. An image is an executable prefix, an
//! optional password blob, then the archive, with all archive offsets
//! relative to the start of the archive proper.

use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::ZipFs;
use super::archive::find_toc;
use super::crypt::{self, RotatedPassword};
use super::error::{ZipError, ZipResult};
use super::format::{
    self, CentralHeader, EndRecord, FLAG_ENCRYPTED, FLAG_UTF8, LOCAL_HEADER_LEN, LocalHeader,
    METHOD_DEFLATED, METHOD_STORED,
};
use super::time;
use crate::vfs::error::{VfsError, VfsResult};

/// Streams members into an archive, tracking the absolute position.
struct ArchiveWriter<'p, W: Write> {
    out: W,
    pos: u64,
    data_start: u64,
    password: Option<&'p [u8]>,
    central: Vec<(CentralHeader, String)>,
    names: HashSet<String>,
}

impl<'p, W: Write> ArchiveWriter<'p, W> {
    fn new(out: W, pos: u64, password: Option<&'p [u8]>) -> Self {
        Self {
            out,
            pos,
            data_start: pos,
            password,
            central: Vec::new(),
            names: HashSet::new(),
        }
    }

    fn emit(&mut self, bytes: &[u8]) -> VfsResult<()> {
        self.out.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    fn add(&mut self, name: &str, content: &[u8], mtime: i64) -> VfsResult<()> {
        if !self.names.insert(name.to_string()) {
            return Err(ZipError::NonUniquePath(name.to_string()).into());
        }
        let name_len =
            u16::try_from(name.len()).map_err(|_| ZipError::PathTooLong(name.to_string()))?;
        let size = u32::try_from(content.len()).map_err(|_| ZipError::FileSizeError)?;
        let crc = crc32fast::hash(content);

        let header_pos = self.pos;
        let extra = format::alignment_extra(header_pos + (LOCAL_HEADER_LEN + name.len()) as u64);

        let sealed = self.password.map(|pw| crypt::seal_header(pw, crc));
        let crypt_len = if sealed.is_some() {
            format::CRYPT_HEADER_LEN
        } else {
            0
        };

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(content)?;
        let deflated = encoder.finish()?;
        let (method, mut payload) = if deflated.len() + crypt_len >= content.len() {
            (METHOD_STORED, content.to_vec())
        } else {
            (METHOD_DEFLATED, deflated)
        };

        let mut flags = FLAG_UTF8;
        let mut crypt_header = Vec::new();
        if let Some((header, mut keys)) = sealed {
            flags |= FLAG_ENCRYPTED;
            keys.encode_in_place(&mut payload);
            crypt_header.extend_from_slice(&header);
        }
        let compressed_size = u32::try_from(payload.len() + crypt_len)
            .map_err(|_| ZipError::FileSizeError)?;

        let local = LocalHeader {
            flags,
            method,
            dos_time: time::to_dos_time(mtime),
            dos_date: time::to_dos_date(mtime),
            crc,
            compressed_size,
            size,
            name_len,
            extra_len: extra.len() as u16,
        };
        let mut head = Vec::with_capacity(LOCAL_HEADER_LEN + name.len() + extra.len());
        local.write(&mut head);
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(&extra);
        self.emit(&head)?;
        self.emit(&crypt_header)?;
        self.emit(&payload)?;

        self.central.push((
            CentralHeader {
                flags,
                method,
                dos_time: local.dos_time,
                dos_date: local.dos_date,
                crc,
                compressed_size,
                size,
                name_len,
                extra_len: 0,
                comment_len: 0,
                local_offset: (header_pos - self.data_start) as u32,
            },
            name.to_string(),
        ));
        Ok(())
    }

    fn finish(mut self) -> VfsResult<W> {
        if self.central.is_empty() {
            return Err(ZipError::EmptyArchive.into());
        }
        let entries = u16::try_from(self.central.len())
            .map_err(|_| VfsError::invalid_argument("too many archive members"))?;
        let dir_start = self.pos;
        let mut directory = Vec::new();
        for (header, name) in &self.central {
            header.write(&mut directory);
            directory.extend_from_slice(name.as_bytes());
        }
        self.emit(&directory)?;
        let mut end = Vec::with_capacity(format::CENTRAL_END_LEN);
        EndRecord {
            entries,
            directory_size: (self.pos - dir_start) as u32,
            directory_offset: (dir_start - self.data_start) as u32,
        }
        .write(&mut end);
        self.emit(&end)?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Encode an in-memory archive from `(name, content)` pairs.
pub fn encode_archive(members: &[(&str, &[u8])], password: Option<&[u8]>) -> VfsResult<Vec<u8>> {
    let password = password.filter(|p| !p.is_empty());
    if let Some(pw) = password {
        crypt::validate_password(pw)?;
    }
    let now = chrono::Utc::now().timestamp();
    let mut writer = ArchiveWriter::new(Vec::new(), 0, password);
    for (name, content) in members {
        writer.add(name.trim_start_matches('/'), content, now)?;
    }
    writer.finish()
}

/// Archive and image construction.
///
/// ```no_run
/// use zvfs_kernel::vfs::backends::zip::ZipBuilder;
///
/// ZipBuilder::new()
///     .strip_prefix("app")
///     .mkzip("app.zip".as_ref(), "app".as_ref())?;
/// # Ok::<(), zvfs_kernel::vfs::VfsError>(())
/// ```
#[derive(Default)]
pub struct ZipBuilder<'a> {
    password: Option<Vec<u8>>,
    strip: Option<String>,
    mounts: Option<&'a ZipFs>,
}

impl std::fmt::Debug for ZipBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipBuilder")
            .field("encrypted", &self.password.is_some())
            .field("strip", &self.strip)
            .finish()
    }
}

impl Drop for ZipBuilder<'_> {
    fn drop(&mut self) {
        if let Some(pw) = self.password.as_mut() {
            pw.fill(0);
        }
    }
}

impl<'a> ZipBuilder<'a> {
    /// Builder with no password and no prefix stripping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypt members with `password`. An empty password means none.
    pub fn password(mut self, password: &[u8]) -> ZipResult<Self> {
        crypt::validate_password(password)?;
        self.password = (!password.is_empty()).then(|| password.to_vec());
        Ok(self)
    }

    /// Remove this prefix from collected file names. Files whose names
    /// don't extend the prefix are left out.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip = Some(prefix.into());
        self
    }

    /// Take image prefixes from archives mounted in `fs` when the image
    /// file is one of them.
    pub fn with_mounts(mut self, fs: &'a ZipFs) -> Self {
        self.mounts = Some(fs);
        self
    }

    /// Archive every file below `dir`.
    pub fn mkzip(&self, out: &Path, dir: &Path) -> VfsResult<()> {
        let files = self.collect(dir)?;
        self.build(out, None, &files)
    }

    /// Archive explicit `file, name, file, name, ...` pairs.
    pub fn lmkzip<S: AsRef<str>>(&self, out: &Path, mapping: &[S]) -> VfsResult<()> {
        let files = Self::pairs(mapping)?;
        self.build(out, None, &files)
    }

    /// Like [`ZipBuilder::mkzip`], behind an executable prefix. The image
    /// defaults to the running executable.
    pub fn mkimg(&self, out: &Path, dir: &Path, image: Option<&Path>) -> VfsResult<()> {
        let files = self.collect(dir)?;
        let image = Self::image_path(image)?;
        self.build(out, Some(&image), &files)
    }

    /// Like [`ZipBuilder::lmkzip`], behind an executable prefix.
    pub fn lmkimg<S: AsRef<str>>(
        &self,
        out: &Path,
        mapping: &[S],
        image: Option<&Path>,
    ) -> VfsResult<()> {
        let files = Self::pairs(mapping)?;
        let image = Self::image_path(image)?;
        self.build(out, Some(&image), &files)
    }

    fn image_path(image: Option<&Path>) -> VfsResult<PathBuf> {
        match image {
            Some(p) => Ok(p.to_path_buf()),
            None => Ok(std::env::current_exe()?),
        }
    }

    fn pairs<S: AsRef<str>>(mapping: &[S]) -> VfsResult<Vec<(PathBuf, String)>> {
        if mapping.len() % 2 != 0 {
            return Err(ZipError::OddMappingList.into());
        }
        let files: Vec<(PathBuf, String)> = mapping
            .chunks(2)
            .filter_map(|pair| {
                let name = pair[1].as_ref().trim_start_matches('/');
                (!name.is_empty()).then(|| (PathBuf::from(pair[0].as_ref()), name.to_string()))
            })
            .collect();
        if files.is_empty() {
            return Err(ZipError::EmptyArchive.into());
        }
        Ok(files)
    }

    /// Regular files below `dir`, sorted, with their archive names.
    fn collect(&self, dir: &Path) -> VfsResult<Vec<(PathBuf, String)>> {
        let mut found = Vec::new();
        walk(dir, &mut found)?;
        found.sort();

        let strip = self.strip.as_deref().unwrap_or("");
        let files: Vec<(PathBuf, String)> = found
            .into_iter()
            .filter_map(|path| {
                let full = path.to_string_lossy().replace('\\', "/");
                let rest = if strip.is_empty() {
                    full.as_str()
                } else if full.len() > strip.len() && full.starts_with(strip) {
                    &full[strip.len()..]
                } else {
                    return None;
                };
                let name = rest.trim_start_matches('/');
                (!name.is_empty()).then(|| (path.clone(), name.to_string()))
            })
            .collect();
        if files.is_empty() {
            return Err(ZipError::EmptyArchive.into());
        }
        Ok(files)
    }

    fn build(&self, out: &Path, image: Option<&Path>, files: &[(PathBuf, String)]) -> VfsResult<()> {
        tracing::debug!(
            "writing {} ({} members{})",
            out.display(),
            files.len(),
            if image.is_some() { ", image" } else { "" }
        );
        let mut sink = BufWriter::new(File::create(out)?);
        let mut pos = 0u64;
        if let Some(image) = image {
            let prefix = self.image_prefix(image)?;
            sink.write_all(&prefix)?;
            pos += prefix.len() as u64;
            if let Some(pw) = &self.password {
                let blob = RotatedPassword::from_plain(pw).blob();
                sink.write_all(&blob)?;
                pos += blob.len() as u64;
            }
        }

        let mut writer = ArchiveWriter::new(sink, pos, self.password.as_deref());
        for (path, name) in files {
            let content = std::fs::read(path)?;
            let mtime = std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map_or_else(|| chrono::Utc::now().timestamp(), |d| d.as_secs() as i64);
            writer.add(name, &content, mtime)?;
        }
        writer.finish()?;
        Ok(())
    }

    /// Executable bytes to put in front of the archive: a mounted or
    /// parseable archive contributes everything before its own data and
    /// password blob, anything else is copied whole.
    fn image_prefix(&self, image: &Path) -> VfsResult<Vec<u8>> {
        if let Some(fs) = self.mounts {
            let key = super::archive_key(image);
            if let Some(archive) = fs.archive_named(&key) {
                return Ok(archive.data()[..archive.pass_offset()].to_vec());
            }
        }
        let mut data = std::fs::read(image)?;
        let keep = find_toc(&data, false).map_or(data.len(), |toc| toc.pass_offset);
        data.truncate(keep);
        Ok(data)
    }
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> VfsResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let kind = entry.file_type()?;
        if kind.is_dir() {
            walk(&path, found)?;
        } else if kind.is_file() || path.is_file() {
            found.push(path);
        }
    }
    Ok(())
}
