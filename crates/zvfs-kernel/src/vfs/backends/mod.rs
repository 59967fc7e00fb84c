//! Filesystem backends.
//!
//! Backends implement [`Filesystem`](super::Filesystem) for different kinds
//! of storage.

mod memory;
mod native;
pub mod zip;

pub use memory::MemoryFs;
pub use native::NativeFs;
pub use zip::{ListFilter, ZipBuilder, ZipError, ZipFs};
