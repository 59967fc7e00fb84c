//! Generic channel layer.
//!
//! A [`Channel`] is a named, moded byte stream over a boxed
//! [`ChannelDriver`]. ZIP entries, native files and reflected channels all
//! plug in here. Optional driver operations (seek, blocking mode, options)
//! are advertised through [`DriverCaps`] so callers can tell "not
//! supported" apart from "failed".
//!
//! Handler errors are kept as the channel's bypass error and can be fetched
//! with [`Channel::take_error`] after the call that produced them returns.

pub mod bypass;
mod error;
pub mod forward;
pub mod reflect;

use std::fmt;
use std::io::{self, SeekFrom};

pub use bypass::ErrorBundle;
pub use error::{ChanError, ChanResult, owner_lost_bundle};
pub use forward::EventQueue;
pub use reflect::{ChannelHandler, HandlerResult, MethodName, MethodSet, ReflectedChannel};

/// Direction flags, used both for the open mode and for event interest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChanMode {
    /// Readable / interested in read events.
    pub readable: bool,
    /// Writable / interested in write events.
    pub writable: bool,
}

/// Event interest uses the same flag pair as the open mode.
pub type EventMask = ChanMode;

impl ChanMode {
    /// No direction.
    pub const NONE: ChanMode = ChanMode {
        readable: false,
        writable: false,
    };
    /// Read only.
    pub const READ: ChanMode = ChanMode {
        readable: true,
        writable: false,
    };
    /// Write only.
    pub const WRITE: ChanMode = ChanMode {
        readable: false,
        writable: true,
    };
    /// Both directions.
    pub const READ_WRITE: ChanMode = ChanMode {
        readable: true,
        writable: true,
    };

    /// Flags set in both.
    pub fn intersect(self, other: ChanMode) -> ChanMode {
        ChanMode {
            readable: self.readable && other.readable,
            writable: self.writable && other.writable,
        }
    }

    /// True when neither flag is set.
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    /// True when every flag in `other` is also set here.
    pub fn contains(self, other: ChanMode) -> bool {
        (self.readable || !other.readable) && (self.writable || !other.writable)
    }

    /// Event names: `read` and/or `write`.
    pub fn names(self) -> Vec<&'static str> {
        let mut out = Vec::with_capacity(2);
        if self.readable {
            out.push("read");
        }
        if self.writable {
            out.push("write");
        }
        out
    }

    /// Parse a list of event names.
    pub fn parse_events<S: AsRef<str>>(names: &[S]) -> ChanResult<ChanMode> {
        let mut mask = ChanMode::NONE;
        for name in names {
            match name.as_ref() {
                "read" => mask.readable = true,
                "write" => mask.writable = true,
                other => {
                    return Err(ChanError::handler(format!(
                        "bad event \"{other}\": must be read or write"
                    )));
                }
            }
        }
        Ok(mask)
    }
}

/// Optional operations a driver structurally provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCaps {
    /// `seek` is available.
    pub seek: bool,
    /// `set_blocking` is available.
    pub blocking: bool,
    /// `set_option` is available.
    pub set_option: bool,
    /// `get_option` is available.
    pub get_option: bool,
}

/// Backing implementation of a channel.
///
/// Every optional operation defaults to `Unsupported`; `caps` must agree
/// with what is overridden.
pub trait ChannelDriver: Send {
    /// Short type name for diagnostics.
    fn type_name(&self) -> &'static str;

    /// Which optional operations are present.
    fn caps(&self) -> DriverCaps {
        DriverCaps::default()
    }

    /// Read up to `buf.len()` bytes. Zero means end of stream.
    fn read(&mut self, _buf: &mut [u8]) -> ChanResult<usize> {
        Err(ChanError::Unsupported("read"))
    }

    /// Write some prefix of `buf`, returning how much was taken.
    fn write(&mut self, _buf: &[u8]) -> ChanResult<usize> {
        Err(ChanError::Unsupported("write"))
    }

    /// Reposition, returning the new absolute offset.
    fn seek(&mut self, _pos: SeekFrom) -> ChanResult<u64> {
        Err(ChanError::Unsupported("seek"))
    }

    /// Release the driver. Called exactly once.
    fn close(&mut self) -> ChanResult<()> {
        Ok(())
    }

    /// Change which events the channel wants notification for.
    fn watch(&mut self, _interest: EventMask) {}

    /// Switch blocking mode.
    fn set_blocking(&mut self, _blocking: bool) -> ChanResult<()> {
        Err(ChanError::Unsupported("blocking"))
    }

    /// Read one option, or all options when `name` is `None`.
    fn get_option(&mut self, _name: Option<&str>) -> ChanResult<Vec<(String, String)>> {
        Err(ChanError::Unsupported("cget"))
    }

    /// Set one option.
    fn set_option(&mut self, _name: &str, _value: &str) -> ChanResult<()> {
        Err(ChanError::Unsupported("configure"))
    }
}

/// An open channel.
pub struct Channel {
    name: String,
    mode: ChanMode,
    driver: Option<Box<dyn ChannelDriver>>,
    error: Option<ErrorBundle>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("open", &self.driver.is_some())
            .finish()
    }
}

impl Channel {
    /// Wrap a driver.
    pub fn new(name: impl Into<String>, mode: ChanMode, driver: Box<dyn ChannelDriver>) -> Self {
        Self {
            name: name.into(),
            mode,
            driver: Some(driver),
            error: None,
        }
    }

    /// Handle name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open mode.
    pub fn mode(&self) -> ChanMode {
        self.mode
    }

    /// Driver capabilities; empty once closed.
    pub fn caps(&self) -> DriverCaps {
        self.driver.as_ref().map(|d| d.caps()).unwrap_or_default()
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.driver.is_none()
    }

    /// Fetch and clear the stored handler error.
    pub fn take_error(&mut self) -> Option<ErrorBundle> {
        self.error.take()
    }

    fn driver(&mut self) -> ChanResult<&mut Box<dyn ChannelDriver>> {
        self.driver.as_mut().ok_or(ChanError::Closed)
    }

    fn record<T>(&mut self, result: ChanResult<T>) -> ChanResult<T> {
        if let Err(e) = &result {
            if let Some(bundle) = e.bundle() {
                self.error = Some(bundle);
            }
        }
        result
    }

    /// Read into `buf`.
    pub fn read_some(&mut self, buf: &mut [u8]) -> ChanResult<usize> {
        if !self.mode.readable {
            return Err(ChanError::WrongMode {
                name: self.name.clone(),
                direction: "reading",
            });
        }
        let result = self.driver()?.read(buf);
        self.record(result)
    }

    /// Read until end of stream.
    pub fn read_to_vec(&mut self) -> ChanResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read_some(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Write part of `buf`.
    pub fn write_some(&mut self, buf: &[u8]) -> ChanResult<usize> {
        if !self.mode.writable {
            return Err(ChanError::WrongMode {
                name: self.name.clone(),
                direction: "writing",
            });
        }
        let result = self.driver()?.write(buf);
        self.record(result)
    }

    /// Write all of `buf`.
    pub fn write_all_bytes(&mut self, mut buf: &[u8]) -> ChanResult<()> {
        while !buf.is_empty() {
            let n = self.write_some(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Reposition.
    pub fn seek_to(&mut self, pos: SeekFrom) -> ChanResult<u64> {
        let driver = self.driver()?;
        if !driver.caps().seek {
            return Err(ChanError::Unsupported("seek"));
        }
        let result = driver.seek(pos);
        self.record(result)
    }

    /// Set event interest.
    pub fn watch(&mut self, interest: EventMask) -> ChanResult<()> {
        let mask = interest.intersect(self.mode);
        self.driver()?.watch(mask);
        Ok(())
    }

    /// Switch blocking mode.
    pub fn set_blocking(&mut self, blocking: bool) -> ChanResult<()> {
        let driver = self.driver()?;
        if !driver.caps().blocking {
            return Err(ChanError::Unsupported("blocking"));
        }
        let result = driver.set_blocking(blocking);
        self.record(result)
    }

    /// Set a driver option.
    pub fn configure(&mut self, name: &str, value: &str) -> ChanResult<()> {
        let driver = self.driver()?;
        if !driver.caps().set_option {
            return Err(ChanError::Unsupported("configure"));
        }
        let result = driver.set_option(name, value);
        self.record(result)
    }

    /// Read one driver option.
    pub fn cget(&mut self, name: &str) -> ChanResult<String> {
        let driver = self.driver()?;
        if !driver.caps().get_option {
            return Err(ChanError::Unsupported("cget"));
        }
        let result = driver
            .get_option(Some(name))
            .map(|mut pairs| pairs.pop().map(|(_, v)| v).unwrap_or_default());
        self.record(result)
    }

    /// Read every driver option.
    pub fn cget_all(&mut self) -> ChanResult<Vec<(String, String)>> {
        let driver = self.driver()?;
        if !driver.caps().get_option {
            return Err(ChanError::Unsupported("cgetall"));
        }
        let result = driver.get_option(None);
        self.record(result)
    }

    /// Close the driver. A handler error is returned and also kept for
    /// [`Channel::take_error`].
    pub fn close(&mut self) -> ChanResult<()> {
        let Some(mut driver) = self.driver.take() else {
            return Ok(());
        };
        let result = driver.close();
        self.record(result)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            if let Err(e) = driver.close() {
                tracing::warn!("error closing channel {}: {}", self.name, e);
            }
        }
    }
}

impl io::Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_some(buf).map_err(io::Error::from)
    }
}

impl io::Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_some(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for Channel {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.seek_to(pos).map_err(io::Error::from)
    }
}
