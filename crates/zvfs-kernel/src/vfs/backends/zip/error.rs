//! ZIP archive errors.
//!
//! Each structural problem found while mounting, reading or building an
//! archive has its own variant. Conditions that have a natural POSIX
//! meaning (missing entry, busy mount, oversized write) are reported as
//! [`crate::vfs::VfsError`] variants instead.

use thiserror::Error;

/// Structural archive error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZipError {
    /// No end-of-central-directory record anywhere in the file.
    #[error("archive directory end signature not found")]
    EndSignatureNotFound,

    /// The directory lists no entries, or there was nothing to put in a new
    /// archive.
    #[error("empty archive")]
    EmptyArchive,

    /// Directory offset/size point past the end record.
    #[error("archive directory truncated")]
    DirectoryOverlapsEnd,

    /// A central record runs past the directory.
    #[error("truncated directory")]
    TruncatedDirectory,

    /// A central record has the wrong signature.
    #[error("wrong header signature")]
    WrongHeaderSignature,

    /// A central record points at something that isn't a local header.
    #[error("Failed to find local header")]
    LocalHeaderNotFound,

    /// The entry count covers less than the directory size.
    #[error("short file count")]
    ShortFileCount,

    /// Directory offsets are outside the file.
    #[error("bad zip data")]
    BadZipData,

    /// File is too small to be an archive, or too large to read onto the heap.
    #[error("illegal file size")]
    IllegalFileSize,

    /// File is shorter than an end record.
    #[error("truncated file")]
    TruncatedFile,

    /// Password contains the 0xFF byte.
    #[error("password must not contain 0xFF")]
    PasswordContainsFF,

    /// Password is longer than 255 bytes.
    #[error("password too long")]
    PasswordTooLong,

    /// Mount point names a foreign volume.
    #[error("Invalid mount path \"{0}\"")]
    InvalidMountPath(String),

    /// Something is already mounted there.
    #[error("{archive} is already mounted on {mount_point}")]
    AlreadyMounted {
        /// Archive currently mounted.
        archive: String,
        /// The contested mount point.
        mount_point: String,
    },

    /// Writes are disabled (maximum write size is zero).
    #[error("writes not permitted")]
    WritesNotPermitted,

    /// Opening a missing entry for writing.
    #[error("file \"{0}\" not created")]
    FileNotCreated(String),

    /// Entry sizes or offset are out of range, usually zip64.
    #[error("file size error (may be zip64)")]
    FileSizeError,

    /// Neither stored nor deflated.
    #[error("unsupported compression method")]
    UnsupportedCompression(u16),

    /// Encrypted entry shorter than its crypt header.
    #[error("decryption failed: truncated decryption header")]
    TruncatedCryptHeader,

    /// Encrypted entry but the archive has no password.
    #[error("decryption failed - no password provided")]
    NoPassword,

    /// Crypt header check byte mismatch.
    #[error("invalid password")]
    InvalidPassword,

    /// Inflate failed or produced the wrong length.
    #[error("decompression error")]
    Decompression,

    /// A buffer for entry content could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// Decoded content does not match the recorded CRC-32.
    #[error("invalid CRC")]
    InvalidCrc,

    /// Existing content is larger than the write cap.
    #[error("file size exceeds max writable")]
    ExceedsMaxWritable,

    /// A mapping list with an odd number of elements.
    #[error("need even number of elements")]
    OddMappingList,

    /// Two inputs map to the same archive name.
    #[error("non-unique path name \"{0}\"")]
    NonUniquePath(String),

    /// Archive name doesn't fit a header.
    #[error("path too long for \"{0}\"")]
    PathTooLong(String),

    /// Attributes can't be changed.
    #[error("unsupported operation")]
    UnsupportedOperation,

    /// Attribute index out of range.
    #[error("unknown attribute")]
    UnknownAttribute,

    /// Not an entry of any mounted archive.
    #[error("path \"{0}\" not found in any zipfs volume")]
    NotInVolume(String),

    /// `list` was given a regular expression that doesn't compile.
    #[error("bad pattern: {0}")]
    BadPattern(String),
}

/// ZIP result type.
pub type ZipResult<T> = Result<T, ZipError>;
