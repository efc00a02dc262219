//! Container configuration
//!
//! Tunables that belong to the embedding application rather than to the
//! image itself. Loadable from TOML:
//!
//! ```toml
//! host_io_granularity = 4096
//! sync_on_close = true
//! max_backing_bytes = 1073741824
//! read_only = false
//! ```

use crate::error::{Result, VdiError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default zero-fill chunk size, one host page
pub const DEFAULT_HOST_IO_GRANULARITY: usize = 4096;

/// Settings applied when a container is opened or created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Chunk size used when zero-filling newly allocated blocks
    ///
    /// Image blocks are normally far larger than a host I/O unit. A block
    /// size that is not a multiple of this value ends with one shorter chunk.
    pub host_io_granularity: usize,

    /// Persist a dirty allocation table when the container is closed
    pub sync_on_close: bool,

    /// Ceiling on the backing store's size; growth past it fails allocation
    pub max_backing_bytes: Option<u64>,

    /// Refuse every Write-intent translation
    pub read_only: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            host_io_granularity: DEFAULT_HOST_IO_GRANULARITY,
            sync_on_close: true,
            max_backing_bytes: None,
            read_only: false,
        }
    }
}

impl ContainerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ContainerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| VdiError::InvalidConfig(e.to_string()))
    }

    /// Validate all fields
    pub fn validate(&self) -> Result<()> {
        if self.host_io_granularity == 0 {
            return Err(VdiError::InvalidConfig(
                "host_io_granularity must be non-zero".into(),
            ));
        }
        if self.max_backing_bytes == Some(0) {
            return Err(VdiError::InvalidConfig(
                "max_backing_bytes must be non-zero when set".into(),
            ));
        }
        Ok(())
    }
}
