//! # zvfs-kernel
//!
//! Pluggable virtual filesystem core.
//!
//! - Backends register with a [`Vfs`]; every path operation is dispatched to
//!   the most recently registered backend that claims the path, with the
//!   native filesystem as the fixed tail entry
//! - Paths memoize their normalized form and backend binding, invalidated by
//!   an epoch counter whenever the set of backends or mounts changes
//! - [`ZipFs`] serves mounted ZIP archives (including self-extracting images
//!   and obfuscated entries) straight from mapped memory
//! - [`ReflectedChannel`] lets a handler on one thread implement a channel
//!   used from any thread

pub mod chan;
pub mod config;
pub mod vfs;

pub use chan::{
    ChanError, ChanMode, ChanResult, Channel, ChannelDriver, ChannelHandler, DriverCaps,
    ErrorBundle, EventQueue, HandlerResult, MethodName, MethodSet, ReflectedChannel,
};
pub use config::VfsConfig;
pub use vfs::{
    AccessMode, FileAttr, FileType, Filesystem, FsPath, GlobTypes, MemoryFs, NativeFs,
    OpenFlags, Vfs, VfsError, VfsResult, ZipFs,
    backends::{ListFilter, ZipBuilder, ZipError},
};
