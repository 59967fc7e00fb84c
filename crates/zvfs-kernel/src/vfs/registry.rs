//! Ordered filesystem registry with epoch invalidation.
//!
//! Backends are tried head to tail; the most recently registered wins. The
//! native backend is installed at construction as the default record and
//! always stays at the tail. Every change bumps the epoch so cached
//! path→backend bindings can tell they are stale.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::drain::{DrainGuard, DrainLock};
use super::error::{VfsError, VfsResult};
use super::filesystem::Filesystem;

/// Shared handle on a registry's epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochCounter(Arc<AtomicU64>);

impl EpochCounter {
    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance, returning the new value.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// One registered backend.
pub struct FsRecord {
    /// The backend.
    pub fs: Arc<dyn Filesystem>,
    /// Display name ("native", "zipfs", ...).
    pub name: String,
    /// The native tail record, which can't be removed.
    pub is_default: bool,
}

impl fmt::Debug for FsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsRecord")
            .field("name", &self.name)
            .field("is_default", &self.is_default)
            .finish()
    }
}

impl FsRecord {
    /// Whether this record wraps `fs`.
    pub fn holds(&self, fs: &Arc<dyn Filesystem>) -> bool {
        Arc::ptr_eq(&self.fs, fs)
    }
}

/// The ordered backend list.
pub struct FsRegistry {
    list: DrainLock<Vec<Arc<FsRecord>>>,
    default: Arc<FsRecord>,
    epoch: EpochCounter,
}

impl fmt::Debug for FsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsRegistry")
            .field("names", &self.names())
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl FsRegistry {
    /// A registry holding only the default backend.
    pub fn new(name: impl Into<String>, default_fs: Arc<dyn Filesystem>) -> Self {
        let epoch = EpochCounter::default();
        default_fs.registered(epoch.clone());
        let record = Arc::new(FsRecord {
            fs: default_fs,
            name: name.into(),
            is_default: true,
        });
        Self {
            list: DrainLock::new(vec![Arc::clone(&record)]),
            default: record,
            epoch,
        }
    }

    /// Prepend a backend.
    pub fn register(&self, name: impl Into<String>, fs: Arc<dyn Filesystem>) -> VfsResult<()> {
        let name = name.into();
        fs.registered(self.epoch.clone());
        let record = Arc::new(FsRecord {
            fs,
            name: name.clone(),
            is_default: false,
        });
        self.list.write(|list| list.insert(0, record));
        let epoch = self.epoch.bump();
        tracing::debug!("registered filesystem {} (epoch {})", name, epoch);
        Ok(())
    }

    /// Remove a backend. The default record is refused.
    pub fn unregister(&self, fs: &Arc<dyn Filesystem>) -> VfsResult<()> {
        let removed = self.list.write(|list| {
            let pos = list.iter().position(|r| r.holds(fs));
            match pos {
                Some(i) if list[i].is_default => Err(VfsError::DefaultFilesystem),
                Some(i) => Ok(list.remove(i)),
                None => Err(VfsError::not_found("filesystem is not registered")),
            }
        })?;
        let epoch = self.epoch.bump();
        tracing::debug!("unregistered filesystem {} (epoch {})", removed.name, epoch);
        Ok(())
    }

    /// Drop every non-default backend.
    pub fn reset(&self) {
        let dropped = self.list.write(|list| {
            let before = list.len();
            list.retain(|r| r.is_default);
            before - list.len()
        });
        let epoch = self.epoch.bump();
        tracing::debug!("registry reset, dropped {} filesystem(s) (epoch {})", dropped, epoch);
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    /// Shared epoch handle.
    pub fn epoch_counter(&self) -> EpochCounter {
        self.epoch.clone()
    }

    /// Something outside the registry changed which paths a backend owns.
    pub fn notify_mounts_changed(&self) {
        self.epoch.bump();
    }

    /// Iterate head to tail. Writers wait until the guard drops.
    pub fn iter(&self) -> DrainGuard<'_, Vec<Arc<FsRecord>>> {
        self.list.read()
    }

    /// The native tail record.
    pub fn default_record(&self) -> Arc<FsRecord> {
        Arc::clone(&self.default)
    }

    /// First backend that claims `path`.
    pub fn find(&self, path: &str) -> Option<Arc<FsRecord>> {
        let list = self.list.read();
        list.iter().find(|r| r.fs.path_in_filesystem(path)).cloned()
    }

    /// Record wrapping `fs`, if registered.
    pub fn record_for(&self, fs: &Arc<dyn Filesystem>) -> Option<Arc<FsRecord>> {
        self.list.read().iter().find(|r| r.holds(fs)).cloned()
    }

    /// Every backend's volumes, in list order.
    pub fn list_volumes(&self) -> Vec<String> {
        self.list
            .read()
            .iter()
            .flat_map(|r| r.fs.list_volumes())
            .collect()
    }

    /// Names head to tail.
    pub fn names(&self) -> Vec<String> {
        self.list.read().iter().map(|r| r.name.clone()).collect()
    }
}
