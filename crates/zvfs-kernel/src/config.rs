//! VFS configuration.
//!
//! Read from `~/.config/zvfs/config.toml` (or the platform equivalent) when
//! it exists. Every field has a default, so an empty or missing file is
//! fine.
//!
//! ```toml
//! max_write_size = 1048576   # 0 disables writes into archives
//! use_mmap = true
//! heap_read_limit = 67108864
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::vfs::{VfsError, VfsResult};

/// Env override for [`VfsConfig::max_write_size`].
pub const MAX_WRITE_ENV: &str = "ZVFS_MAX_WRITE";

/// Largest archive that is read into memory when mapping is off or fails.
pub const DEFAULT_HEAP_READ_LIMIT: u64 = 64 * 1024 * 1024;

/// Runtime configuration for the archive backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Cap on the size of a file written into a mounted archive. Zero
    /// disables writes.
    pub max_write_size: u64,
    /// Map archives instead of reading them onto the heap.
    pub use_mmap: bool,
    /// Largest archive read onto the heap.
    pub heap_read_limit: u64,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            max_write_size: i32::MAX as u64,
            use_mmap: true,
            heap_read_limit: DEFAULT_HEAP_READ_LIMIT,
        }
    }
}

impl VfsConfig {
    /// Parse TOML text.
    pub fn from_toml_str(text: &str) -> VfsResult<Self> {
        toml::from_str(text).map_err(|e| VfsError::invalid_argument(format!("bad config: {e}")))
    }

    /// Load from a file.
    pub fn load(path: impl AsRef<Path>) -> VfsResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("zvfs").join("config.toml"))
    }

    /// Load the user config if present, then apply env overrides.
    pub fn load_default() -> VfsResult<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!("loading config from {}", path.display());
                Self::load(&path)?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `ZVFS_MAX_WRITE` if set and numeric.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(MAX_WRITE_ENV) {
            match value.trim().parse::<u64>() {
                Ok(n) => self.max_write_size = n,
                Err(_) => tracing::warn!("ignoring non-numeric {}={}", MAX_WRITE_ENV, value),
            }
        }
    }
}
