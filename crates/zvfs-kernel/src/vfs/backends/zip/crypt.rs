//! PKWARE traditional encryption.
//!
//! Three 32-bit keys stirred by the plaintext, with a 12-byte header in
//! front of each encrypted payload. Passwords stored next to an archive are
//! kept reversed with each byte's high nibble bit-reversed; the same
//! rotation is applied to a password given at mount time, so decoding only
//! ever sees the rotated form.

use rand::RngCore;

use super::error::{ZipError, ZipResult};
use super::format::CRYPT_HEADER_LEN;

const KEY0: u32 = 305_419_896;
const KEY1: u32 = 591_751_049;
const KEY2: u32 = 878_082_192;

/// High-nibble table: each entry is the bit-reversed index shifted into
/// the high nibble.
const PWROT: [u8; 16] = [
    0x00, 0x80, 0x40, 0xC0, 0x20, 0xA0, 0x60, 0xE0, 0x10, 0x90, 0x50, 0xD0, 0x30, 0xB0, 0x70,
    0xF0,
];

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = crc_table();

fn crc_step(crc: u32, byte: u8) -> u32 {
    CRC_TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8)
}

/// Cipher state. Scrubbed on drop.
#[derive(Clone)]
pub struct Keys([u32; 3]);

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Keys(..)")
    }
}

impl Keys {
    /// Keys seeded from a plain password.
    pub fn new(password: &[u8]) -> Self {
        let mut keys = Keys([KEY0, KEY1, KEY2]);
        for &b in password {
            keys.update(b);
        }
        keys
    }

    fn update(&mut self, plain: u8) {
        let k = &mut self.0;
        k[0] = crc_step(k[0], plain);
        k[1] = k[1]
            .wrapping_add(k[0] & 0xff)
            .wrapping_mul(134_775_813)
            .wrapping_add(1);
        k[2] = crc_step(k[2], (k[1] >> 24) as u8);
    }

    fn stream_byte(&self) -> u8 {
        let t = (self.0[2] | 2) & 0xffff;
        ((t.wrapping_mul(t ^ 1)) >> 8) as u8
    }

    /// Decrypt one byte.
    pub fn decode(&mut self, cipher: u8) -> u8 {
        let plain = cipher ^ self.stream_byte();
        self.update(plain);
        plain
    }

    /// Encrypt one byte.
    pub fn encode(&mut self, plain: u8) -> u8 {
        let cipher = plain ^ self.stream_byte();
        self.update(plain);
        cipher
    }

    /// Decrypt a buffer.
    pub fn decode_all(&mut self, data: &[u8]) -> Vec<u8> {
        data.iter().map(|&b| self.decode(b)).collect()
    }

    /// Encrypt a buffer in place.
    pub fn encode_in_place(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b = self.encode(*b);
        }
    }
}

impl Drop for Keys {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

/// A password in rotated storage form. Scrubbed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct RotatedPassword(Vec<u8>);

impl std::fmt::Debug for RotatedPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RotatedPassword({} bytes)", self.0.len())
    }
}

impl RotatedPassword {
    /// Rotate a plain password.
    pub fn from_plain(password: &[u8]) -> Self {
        Self(password.iter().rev().map(|&c| rotate_byte(c)).collect())
    }

    /// Adopt bytes already in rotated form (read from an archive).
    pub fn from_rotated(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Storage bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Recover the plain password. The caller scrubs the result.
    pub fn derive(&self) -> Vec<u8> {
        self.0.iter().rev().map(|&c| rotate_byte(c)).collect()
    }

    /// Keys for this password.
    pub fn keys(&self) -> Keys {
        let mut plain = self.derive();
        let keys = Keys::new(&plain);
        plain.fill(0);
        keys
    }

    /// Blob written in front of an archive:
    /// `[rotated bytes][len][PASSWORD_END_SIG]`.
    pub fn blob(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() + 5);
        out.extend_from_slice(&self.0);
        out.push(self.0.len() as u8);
        out.extend_from_slice(&super::format::PASSWORD_END_SIG.to_le_bytes());
        out
    }
}

impl Drop for RotatedPassword {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

fn rotate_byte(c: u8) -> u8 {
    (c & 0x0f) | PWROT[((c >> 4) & 0x0f) as usize]
}

/// Reject passwords that can't be stored in a blob.
pub fn validate_password(password: &[u8]) -> ZipResult<()> {
    if password.len() > 255 {
        return Err(ZipError::PasswordTooLong);
    }
    if password.contains(&0xff) {
        return Err(ZipError::PasswordContainsFF);
    }
    Ok(())
}

/// Decrypt the crypt header at the front of `payload` and check it against
/// the entry's DOS time or CRC. Returns keys positioned at the first data
/// byte.
pub fn open_header(
    password: &RotatedPassword,
    payload: &[u8],
    dos_time: u16,
    crc: u32,
) -> ZipResult<Keys> {
    let header = payload
        .get(..CRYPT_HEADER_LEN)
        .ok_or(ZipError::TruncatedCryptHeader)?;
    let mut keys = password.keys();
    let mut plain = keys.decode_all(header);
    let check = plain[CRYPT_HEADER_LEN - 1];
    plain.fill(0);
    let valid = check == (dos_time >> 8) as u8 || crc == 0 || check == (crc >> 24) as u8;
    if !valid {
        return Err(ZipError::InvalidPassword);
    }
    Ok(keys)
}

/// Write a fresh crypt header for an entry with checksum `crc`. Returns
/// the encrypted header and keys positioned at the first data byte.
pub fn seal_header(password: &[u8], crc: u32) -> ([u8; CRYPT_HEADER_LEN], Keys) {
    let mut random = [0u8; CRYPT_HEADER_LEN - 2];
    rand::thread_rng().fill_bytes(&mut random);

    // The random bytes go through the cipher once before being used as
    // header plaintext.
    let mut keys = Keys::new(password);
    let mut seed = [0u8; CRYPT_HEADER_LEN - 2];
    for (dst, &src) in seed.iter_mut().zip(random.iter()) {
        *dst = keys.encode(src);
    }
    random.fill(0);

    let mut keys = Keys::new(password);
    let mut header = [0u8; CRYPT_HEADER_LEN];
    for (dst, &src) in header.iter_mut().zip(seed.iter()) {
        *dst = keys.encode(src);
    }
    seed.fill(0);
    header[CRYPT_HEADER_LEN - 2] = keys.encode((crc >> 16) as u8);
    header[CRYPT_HEADER_LEN - 1] = keys.encode((crc >> 24) as u8);
    (header, keys)
}
