//! Current working directory tracking.
//!
//! One shared value per [`super::Vfs`] under a mutex, tagged with an epoch
//! that moves whenever the value changes. Each thread keeps its own copy and
//! only takes the lock when the epoch says its copy is out of date.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::path::FsPath;

thread_local! {
    static THREAD_CWD: RefCell<HashMap<u64, (Option<FsPath>, u64)>> = RefCell::new(HashMap::new());
}

pub(crate) struct CwdTracker {
    vfs_id: u64,
    shared: Mutex<Option<FsPath>>,
    epoch: AtomicU64,
}

impl CwdTracker {
    pub(crate) fn new(vfs_id: u64) -> Self {
        Self {
            vfs_id,
            shared: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// Bumped on every change of the shared value.
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// The recorded cwd, from this thread's copy when it is current.
    pub(crate) fn current(&self) -> Option<FsPath> {
        let epoch = self.epoch();
        let cached = THREAD_CWD.with(|tls| {
            tls.borrow()
                .get(&self.vfs_id)
                .filter(|(_, e)| *e == epoch)
                .map(|(p, _)| p.clone())
        });
        if let Some(path) = cached {
            return path;
        }
        let (path, epoch) = {
            let shared = self.shared.lock();
            (shared.clone(), self.epoch())
        };
        tracing::trace!("cwd thread copy refreshed at epoch {}", epoch);
        THREAD_CWD.with(|tls| {
            tls.borrow_mut().insert(self.vfs_id, (path.clone(), epoch));
        });
        path
    }

    /// Record `path` as the cwd. Returns true if the value changed.
    pub(crate) fn update(&self, path: Option<FsPath>) -> bool {
        let epoch = {
            let mut shared = self.shared.lock();
            let same = match (&*shared, &path) {
                (Some(a), Some(b)) => a.as_str() == b.as_str(),
                (None, None) => true,
                _ => false,
            };
            if same {
                return false;
            }
            *shared = path.clone();
            self.epoch.fetch_add(1, Ordering::AcqRel) + 1
        };
        THREAD_CWD.with(|tls| {
            tls.borrow_mut().insert(self.vfs_id, (path, epoch));
        });
        true
    }

    /// Forget the cwd entirely.
    pub(crate) fn clear(&self) {
        self.update(None);
    }
}

impl Drop for CwdTracker {
    fn drop(&mut self) {
        let _ = THREAD_CWD.try_with(|tls| {
            tls.borrow_mut().remove(&self.vfs_id);
        });
    }
}
