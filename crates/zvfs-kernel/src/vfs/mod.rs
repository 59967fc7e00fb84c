//! Virtual filesystem layer.
//!
//! Key components:
//!
//! - [`Filesystem`] - Capability table every backend implements
//! - [`FsRegistry`] - Ordered backend list; the first backend that claims a
//!   path owns it
//! - [`FsPath`] - Path handle caching its normalized form, owner and native
//!   representation
//! - [`Vfs`] - Dispatcher tying the registry, path cache and cwd together
//! - [`ZipFs`] - Mounted ZIP archives
//!
//! ## Design Decisions
//!
//! - **Epoch invalidation**: every registry change and every mount or
//!   unmount bumps one counter. Cached bindings carry the epoch they were
//!   made under and are recomputed from the string form when it moves.
//! - **Snapshot iteration**: the backend list and the archive table are read
//!   through snapshots; a writer waits for in-flight readers to drain.
//! - **Native tail**: the native backend claims every path and can't be
//!   unregistered, so dispatch always finds an owner.

pub mod backends;
mod cwd;
mod dispatch;
mod drain;
mod error;
mod filesystem;
pub mod path;
mod pattern;
mod registry;
mod types;

pub use backends::{MemoryFs, NativeFs, ZipFs};
pub use dispatch::Vfs;
pub use drain::{DrainGuard, DrainLock};
pub use error::{VfsError, VfsResult};
pub use filesystem::{Filesystem, LoadTarget, NativeRep};
pub use path::{FsPath, PathKind};
pub use registry::{EpochCounter, FsRecord, FsRegistry};
pub use types::{AccessMode, FileAttr, FileType, GlobTypes, OpenFlags};
