//! Channels on archive entries.
//!
//! Readers see either a slice of the mapped archive (stored, unencrypted
//! entries), an owned decoded copy, or the shared payload of an entry that
//! was written earlier. Writers work on a private buffer that replaces the
//! entry's payload when the channel closes.

use std::io::SeekFrom;
use std::sync::Arc;

use super::archive::{EntryKind, ZipArchive, ZipEntry};
use super::error::{ZipError, ZipResult};
use crate::chan::{ChanError, ChanResult, ChannelDriver, DriverCaps};
use crate::vfs::error::VfsError;

/// Where a reader's bytes come from.
pub(crate) enum Source {
    /// `len` bytes of the archive starting at `start`.
    Archive { start: usize, len: usize },
    /// Decoded content.
    Owned(Vec<u8>),
    /// Payload written by an earlier channel.
    Shared(Arc<[u8]>),
}

enum Body {
    Read {
        source: Source,
        /// Directories can't be read or sought.
        directory: bool,
    },
    Write {
        buf: Vec<u8>,
        max_write: usize,
        append: bool,
    },
}

/// Driver for an open archive entry.
pub(crate) struct ZipDriver {
    archive: Arc<ZipArchive>,
    entry: Arc<ZipEntry>,
    body: Body,
    cursor: usize,
    open: bool,
}

impl ZipDriver {
    /// Reader over `source`. The archive's open count must already include
    /// this channel.
    pub(crate) fn reader(entry: Arc<ZipEntry>, source: Source, directory: bool) -> Self {
        Self {
            archive: Arc::clone(entry.archive()),
            entry,
            body: Body::Read { source, directory },
            cursor: 0,
            open: true,
        }
    }

    /// Writer seeded with `initial`.
    pub(crate) fn writer(
        entry: Arc<ZipEntry>,
        initial: Vec<u8>,
        max_write: usize,
        append: bool,
    ) -> Self {
        Self {
            archive: Arc::clone(entry.archive()),
            entry,
            body: Body::Write {
                buf: initial,
                max_write,
                append,
            },
            cursor: 0,
            open: true,
        }
    }

    fn content(&self) -> &[u8] {
        match &self.body {
            Body::Read { source, .. } => match source {
                Source::Archive { start, len } => &self.archive.data()[*start..*start + *len],
                Source::Owned(v) => v,
                Source::Shared(s) => s,
            },
            Body::Write { buf, .. } => buf,
        }
    }

    fn einval(&self) -> ChanError {
        ChanError::Vfs(VfsError::invalid_argument(format!(
            "invalid seek on \"{}\"",
            self.entry.name()
        )))
    }
}

/// Grow `buf`'s capacity to hold `needed` bytes, by half again at a time,
/// never beyond `max`.
fn reserve_growth(buf: &mut Vec<u8>, needed: usize, max: usize) -> ZipResult<()> {
    if needed <= buf.capacity() {
        return Ok(());
    }
    let target = if needed < max - needed / 2 {
        needed + needed / 2
    } else {
        max
    };
    buf.try_reserve_exact(target - buf.len())
        .or_else(|_| buf.try_reserve_exact(needed - buf.len()))
        .map_err(|_| ZipError::OutOfMemory)
}

impl ChannelDriver for ZipDriver {
    fn type_name(&self) -> &'static str {
        "zip"
    }

    fn caps(&self) -> DriverCaps {
        DriverCaps {
            seek: true,
            ..Default::default()
        }
    }

    fn read(&mut self, out: &mut [u8]) -> ChanResult<usize> {
        if let Body::Read {
            directory: true, ..
        } = self.body
        {
            return Err(VfsError::is_a_directory(self.entry.name()).into());
        }
        let data = self.content();
        let start = self.cursor.min(data.len());
        let n = out.len().min(data.len() - start);
        out[..n].copy_from_slice(&data[start..start + n]);
        self.cursor = start + n;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> ChanResult<usize> {
        let Body::Write {
            buf,
            max_write,
            append,
        } = &mut self.body
        else {
            return Err(ChanError::Unsupported("write"));
        };
        if *append {
            self.cursor = buf.len();
        }
        let end = self.cursor + data.len();
        if end > *max_write {
            return Err(VfsError::file_too_large(self.entry.name()).into());
        }
        if end > buf.len() {
            reserve_growth(buf, end, *max_write).map_err(VfsError::from)?;
            buf.resize(end, 0);
        }
        buf[self.cursor..end].copy_from_slice(data);
        self.cursor = end;
        Ok(data.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> ChanResult<u64> {
        let (end, limit) = match &self.body {
            Body::Read {
                directory: true, ..
            } => return Err(self.einval()),
            Body::Read { .. } => {
                let n = self.content().len();
                (n, n)
            }
            Body::Write { buf, max_write, .. } => (buf.len(), *max_write),
        };
        let target = match pos {
            SeekFrom::Start(n) => i64::try_from(n).ok(),
            SeekFrom::Current(d) => (self.cursor as i64).checked_add(d),
            SeekFrom::End(d) => (end as i64).checked_add(d),
        };
        let Some(target) = target.filter(|t| *t >= 0 && *t as u64 <= limit as u64) else {
            return Err(self.einval());
        };
        let target = target as usize;
        if let Body::Write { buf, max_write, .. } = &mut self.body {
            if target > buf.len() {
                reserve_growth(buf, target, *max_write).map_err(VfsError::from)?;
                buf.resize(target, 0);
            }
        }
        self.cursor = target;
        Ok(target as u64)
    }

    fn close(&mut self) -> ChanResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if let Body::Write { buf, .. } = &mut self.body {
            let data: Arc<[u8]> = Arc::from(std::mem::take(buf).into_boxed_slice());
            let len = data.len() as u64;
            let mut st = self.entry.lock();
            st.data = Some(data);
            st.size = len;
            st.compressed_size = len;
            st.method = super::format::METHOD_STORED;
            st.mtime = chrono::Utc::now().timestamp();
            st.kind = EntryKind::File;
            st.encrypted = false;
            st.offset = 0;
            st.crc = 0;
            st.crc_checked = None;
            tracing::debug!("zip entry {} rewritten ({} bytes)", self.entry.name(), len);
        }
        self.archive.closed();
        Ok(())
    }
}

impl Drop for ZipDriver {
    fn drop(&mut self) {
        if self.open {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::backends::zip::{ZipFs, encode_archive};
    use crate::vfs::filesystem::Filesystem;
    use crate::vfs::types::OpenFlags;

    fn one_entry() -> ZipFs {
        let fs = ZipFs::new();
        let data = encode_archive(&[("f.txt", b"abcdef".as_slice())], None).unwrap();
        fs.mount_data(data, "/z").unwrap();
        fs
    }

    #[test]
    fn test_seek_offsets_that_overflow_are_invalid() {
        let fs = one_entry();
        let mut chan = fs.open("/z/f.txt", OpenFlags::read(), 0).unwrap();
        let mut one = [0u8; 1];
        assert_eq!(chan.read_some(&mut one).unwrap(), 1);

        let err = chan.seek_to(SeekFrom::Current(i64::MAX)).unwrap_err();
        assert!(matches!(err, ChanError::Vfs(VfsError::InvalidArgument(_))));
        assert!(chan.seek_to(SeekFrom::End(i64::MIN)).is_err());
        assert!(chan.seek_to(SeekFrom::Start(u64::MAX)).is_err());
        assert_eq!(chan.seek_to(SeekFrom::Current(0)).unwrap(), 1);

        let mut w = fs.open("/z/f.txt", OpenFlags::read_write(), 0).unwrap();
        assert!(w.seek_to(SeekFrom::End(i64::MAX)).is_err());
        assert!(w.seek_to(SeekFrom::Current(i64::MIN)).is_err());
    }

    #[test]
    fn test_reserve_growth_caps_at_max() {
        let mut buf = Vec::new();
        reserve_growth(&mut buf, 10, 100).unwrap();
        assert!(buf.capacity() >= 15);

        let mut buf = Vec::new();
        reserve_growth(&mut buf, 90, 100).unwrap();
        assert!(buf.capacity() >= 100);
        assert!(buf.capacity() < 135);

        let mut buf = vec![0u8; 4];
        assert_eq!(
            reserve_growth(&mut buf, usize::MAX, usize::MAX),
            Err(ZipError::OutOfMemory)
        );
    }
}
