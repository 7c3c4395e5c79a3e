//! Format and mount configuration
//!
//! Options can be built in code or loaded from a TOML file:
//!
//! ```toml
//! [format]
//! inode_count = 32768
//!
//! [mount]
//! cache_blocks = 256
//! sync_commits = false
//! ```

use crate::error::{BlobfsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_INODE_COUNT: u64 = 32768;
pub const DEFAULT_CACHE_BLOCKS: usize = 256;

/// Options for laying out a new image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Inode table capacity; must be a multiple of `INODES_PER_BLOCK`
    pub inode_count: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            inode_count: DEFAULT_INODE_COUNT,
        }
    }
}

/// Options for mounting an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Blocks held by the LRU block cache (0 disables it)
    pub cache_blocks: usize,

    /// Set the sync flag on every created blob
    pub sync_commits: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            sync_commits: false,
        }
    }
}

impl MountOptions {
    pub fn cache_blocks(mut self, cache_blocks: usize) -> Self {
        self.cache_blocks = cache_blocks;
        self
    }

    pub fn sync_commits(mut self, sync: bool) -> Self {
        self.sync_commits = sync;
        self
    }
}

/// Complete configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobfsConfig {
    pub format: FormatOptions,
    pub mount: MountOptions,
}

impl BlobfsConfig {
    /// Parse TOML; missing sections and keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| BlobfsError::invalid(format!("invalid configuration: {}", e)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.as_ref().display(), "loaded configuration");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BlobfsError::invalid(format!("cannot serialize configuration: {}", e)))
    }
}
