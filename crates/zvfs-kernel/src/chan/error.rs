//! Channel error types.

use std::io;
use thiserror::Error;

use super::bypass::{ErrorBundle, quote_element};
use crate::vfs::VfsError;

/// Channel error type.
#[derive(Debug, Error)]
pub enum ChanError {
    /// The handler failed; the bundle is also stored as the channel's
    /// bypass error.
    #[error("{0}")]
    Bypass(ErrorBundle),

    /// The handler broke its contract. Displays as a one-element list.
    #[error("{}", quote_element(.0))]
    Protocol(String),

    /// The handler signalled a raw POSIX errno.
    #[error("posix error {0}")]
    Posix(i32),

    /// Creation-time capability negotiation failed.
    #[error("{0}")]
    Handler(String),

    /// The driver has no such operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// The channel was opened without the needed direction.
    #[error("channel \"{name}\" wasn't opened for {direction}")]
    WrongMode {
        /// Channel handle name.
        name: String,
        /// "reading" or "writing".
        direction: &'static str,
    },

    /// The channel is already closed.
    #[error("channel is closed")]
    Closed,

    /// The thread owning the handler went away.
    #[error("{{Owner lost}}")]
    OwnerLost,

    /// The calling thread's own queue is gone.
    #[error("{{Channel thread lost}}")]
    ThreadLost,

    /// Backend error surfaced through a channel.
    #[error(transparent)]
    Vfs(#[from] VfsError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChanError {
    /// A protocol violation with one of the fixed bypass messages.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// A capability-negotiation failure.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// The bundle to store as the channel's bypass error, if any.
    pub fn bundle(&self) -> Option<ErrorBundle> {
        match self {
            ChanError::Bypass(b) => Some(b.clone()),
            ChanError::Protocol(msg) => Some(ErrorBundle::message(msg.clone())),
            ChanError::OwnerLost => Some(owner_lost_bundle()),
            ChanError::ThreadLost => Some(ErrorBundle::message("Channel thread lost")),
            _ => None,
        }
    }
}

/// The bundle reported when the owning thread is gone.
pub fn owner_lost_bundle() -> ErrorBundle {
    ErrorBundle::message("Owner lost")
        .with_option("-code", "1")
        .with_option("-level", "0")
        .with_option("-errorcode", "NONE")
        .with_option("-errorinfo", "")
        .with_option("-errorline", "1")
}

impl From<ChanError> for io::Error {
    fn from(e: ChanError) -> Self {
        match e {
            ChanError::Io(e) => e,
            ChanError::Vfs(e) => e.into(),
            ChanError::Posix(errno) => io::Error::from_raw_os_error(errno),
            ChanError::Unsupported(op) => io::Error::new(io::ErrorKind::Unsupported, op),
            ChanError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, "channel is closed"),
            ChanError::OwnerLost | ChanError::ThreadLost => {
                io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
            }
            other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
        }
    }
}

/// Channel result type.
pub type ChanResult<T> = Result<T, ChanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_messages() {
        assert_eq!(ChanError::OwnerLost.to_string(), "{Owner lost}");
        assert_eq!(ChanError::ThreadLost.to_string(), "{Channel thread lost}");
        let b = ChanError::OwnerLost.bundle().unwrap();
        assert_eq!(b.text(), Some("Owner lost"));
        assert_eq!(b.option("-errorcode"), Some("NONE"));
    }

    #[test]
    fn test_protocol_display_is_braced() {
        let e = ChanError::protocol("read delivered more than requested");
        assert_eq!(e.to_string(), "{read delivered more than requested}");
    }

    #[test]
    fn test_io_mapping() {
        let e: io::Error = ChanError::Posix(11).into();
        assert_eq!(e.raw_os_error(), Some(11));

        let e: io::Error = ChanError::protocol("write wrote nothing").into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidInput);
    }
}
