//! On-disk ZIP records.
//!
//! Little-endian, fixed layout. Only the fields the backend uses are
//! decoded; writers emit version 2.0 records with the UTF-8 name flag.

/// Local file header signature.
pub const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
/// Central directory file header signature.
pub const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
/// End of central directory signature.
pub const CENTRAL_END_SIG: u32 = 0x0605_4b50;
/// Trailer of a password blob in front of the archive.
pub const PASSWORD_END_SIG: u32 = 0x5a5a_4b50;

/// Local header length.
pub const LOCAL_HEADER_LEN: usize = 30;
/// Central header length.
pub const CENTRAL_HEADER_LEN: usize = 46;
/// End record length.
pub const CENTRAL_END_LEN: usize = 22;
/// PKWARE crypt header length.
pub const CRYPT_HEADER_LEN: usize = 12;

/// Stored (no compression).
pub const METHOD_STORED: u16 = 0;
/// Raw deflate.
pub const METHOD_DEFLATED: u16 = 8;

/// General purpose flag: entry is encrypted.
pub const FLAG_ENCRYPTED: u16 = 0x0001;
/// General purpose flag: name is UTF-8.
pub const FLAG_UTF8: u16 = 0x0800;

/// "Version needed" and "version made by" written into new records.
pub const MIN_VERSION: u16 = 20;

/// Extra-field id used for alignment padding.
pub const ALIGN_EXTRA_ID: u16 = 0xffff;

/// Read a little-endian u16; zero when out of range.
pub fn read_u16(data: &[u8], at: usize) -> u16 {
    data.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .unwrap_or(0)
}

/// Read a little-endian u32; zero when out of range.
pub fn read_u32(data: &[u8], at: usize) -> u32 {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0)
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Local file header fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalHeader {
    pub flags: u16,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc: u32,
    pub compressed_size: u32,
    pub size: u32,
    pub name_len: u16,
    pub extra_len: u16,
}

impl LocalHeader {
    /// Decode the header at `at`. `None` unless the signature matches.
    pub fn parse(data: &[u8], at: usize) -> Option<Self> {
        if at.checked_add(LOCAL_HEADER_LEN)? > data.len() || read_u32(data, at) != LOCAL_HEADER_SIG
        {
            return None;
        }
        Some(Self {
            flags: read_u16(data, at + 6),
            method: read_u16(data, at + 8),
            dos_time: read_u16(data, at + 10),
            dos_date: read_u16(data, at + 12),
            crc: read_u32(data, at + 14),
            compressed_size: read_u32(data, at + 18),
            size: read_u32(data, at + 22),
            name_len: read_u16(data, at + 26),
            extra_len: read_u16(data, at + 28),
        })
    }

    /// Offset of the payload relative to the header start.
    pub fn payload_offset(&self) -> usize {
        LOCAL_HEADER_LEN + self.name_len as usize + self.extra_len as usize
    }

    /// True for a streamed entry whose sizes live in the central record.
    pub fn is_streamed(&self) -> bool {
        self.compressed_size == 0 && self.size == 0 && self.crc == 0
    }

    /// Encode without the name.
    pub fn write(&self, out: &mut Vec<u8>) {
        put_u32(out, LOCAL_HEADER_SIG);
        put_u16(out, MIN_VERSION);
        put_u16(out, self.flags);
        put_u16(out, self.method);
        put_u16(out, self.dos_time);
        put_u16(out, self.dos_date);
        put_u32(out, self.crc);
        put_u32(out, self.compressed_size);
        put_u32(out, self.size);
        put_u16(out, self.name_len);
        put_u16(out, self.extra_len);
    }
}

/// Central directory header fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CentralHeader {
    pub flags: u16,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc: u32,
    pub compressed_size: u32,
    pub size: u32,
    pub name_len: u16,
    pub extra_len: u16,
    pub comment_len: u16,
    pub local_offset: u32,
}

impl CentralHeader {
    /// Decode the record at `at`. The caller checks the signature.
    pub fn parse(data: &[u8], at: usize) -> Self {
        Self {
            flags: read_u16(data, at + 8),
            method: read_u16(data, at + 10),
            dos_time: read_u16(data, at + 12),
            dos_date: read_u16(data, at + 14),
            crc: read_u32(data, at + 16),
            compressed_size: read_u32(data, at + 20),
            size: read_u32(data, at + 24),
            name_len: read_u16(data, at + 28),
            extra_len: read_u16(data, at + 30),
            comment_len: read_u16(data, at + 32),
            local_offset: read_u32(data, at + 42),
        }
    }

    /// Full record length including the variable parts.
    pub fn record_len(&self) -> usize {
        CENTRAL_HEADER_LEN
            + self.name_len as usize
            + self.extra_len as usize
            + self.comment_len as usize
    }

    /// Encode without the name.
    pub fn write(&self, out: &mut Vec<u8>) {
        put_u32(out, CENTRAL_HEADER_SIG);
        put_u16(out, MIN_VERSION);
        put_u16(out, MIN_VERSION);
        put_u16(out, self.flags);
        put_u16(out, self.method);
        put_u16(out, self.dos_time);
        put_u16(out, self.dos_date);
        put_u32(out, self.crc);
        put_u32(out, self.compressed_size);
        put_u32(out, self.size);
        put_u16(out, self.name_len);
        put_u16(out, self.extra_len);
        put_u16(out, self.comment_len);
        put_u16(out, 0); // disk number
        put_u16(out, 0); // internal attributes
        put_u32(out, 0); // external attributes
        put_u32(out, self.local_offset);
    }
}

/// End of central directory record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndRecord {
    pub entries: u16,
    pub directory_size: u32,
    pub directory_offset: u32,
}

impl EndRecord {
    /// Decode the record at `at`.
    pub fn parse(data: &[u8], at: usize) -> Self {
        Self {
            entries: read_u16(data, at + 8),
            directory_size: read_u32(data, at + 12),
            directory_offset: read_u32(data, at + 16),
        }
    }

    /// Encode.
    pub fn write(&self, out: &mut Vec<u8>) {
        put_u32(out, CENTRAL_END_SIG);
        put_u16(out, 0); // this disk
        put_u16(out, 0); // directory disk
        put_u16(out, self.entries);
        put_u16(out, self.entries);
        put_u32(out, self.directory_size);
        put_u32(out, self.directory_offset);
        put_u16(out, 0); // comment length
    }
}

/// Scan backwards for the end record signature.
pub fn find_end_record(data: &[u8]) -> Option<usize> {
    if data.len() < CENTRAL_END_LEN {
        return None;
    }
    (0..=data.len() - CENTRAL_END_LEN)
        .rev()
        .find(|&at| read_u32(data, at) == CENTRAL_END_SIG)
}

/// Extra-field bytes that move a payload starting at `pos` (after the
/// name) onto a 4-byte boundary. Empty when already aligned.
pub fn alignment_extra(pos: u64) -> Vec<u8> {
    if pos % 4 == 0 {
        return Vec::new();
    }
    let pad = ((4 - (pos + 4) % 4) % 4) as usize;
    let mut extra = Vec::with_capacity(4 + pad);
    put_u16(&mut extra, ALIGN_EXTRA_ID);
    put_u16(&mut extra, pad as u16);
    extra.extend((0..pad).map(|i| i as u8));
    extra
}
