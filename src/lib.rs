//! # vdi-container - VirtualBox disk image container
//!
//! `vdi-container` decodes VDI images and exposes the virtual disk inside as a
//! single fixed-size file. It supports:
//!
//! - **Static images** with a preallocated data region (affine mapping)
//! - **Dynamic images** that grow one block at a time on first write
//! - **Lazy, zero-filled allocation** serialized by a single lock, with
//!   lock-free lookups of blocks that are already allocated
//! - **Explicit durability**: the allocation table reaches storage on
//!   [`Container::sync`] or [`Container::close`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vdi_container::{VdiFs, VirtualFile, Result};
//!
//! # fn main() -> Result<()> {
//! let fs = VdiFs::new();
//!
//! // 64 MiB sparse disk in 1 MiB blocks
//! let container = fs.create_dynamic("disk.vdi", 64 << 20, 1 << 20, "scratch")?;
//! let file = fs.mount(container);
//!
//! file.write_at(4096, b"hello")?;
//! let mut buf = [0u8; 5];
//! file.read_at(4096, &mut buf)?;
//!
//! file.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use vdi_container::{VdiFsBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let fs = VdiFsBuilder::new()
//!     .host_io_granularity(64 * 1024)
//!     .max_backing_bytes(1 << 30)
//!     .build()?;
//!
//! let container = fs.open_path("disk.vdi")?;
//! println!("{} bytes", container.declared_size_bytes());
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use self::core::{allocator, config, container, error, header, io, table, translate, vfs};

pub use crate::core::{
    allocator::BlockAllocator,
    config::ContainerConfig,
    container::Container,
    error::{Result, VdiError},
    header::{ContainerHeader, HeaderPatch, ImageType, HEADER_LEN},
    io::{BackingStore, FileBacking, MemBacking},
    table::{BlockAllocationTable, Slot},
    translate::{AddressTranslator, Intent, PhysicalRange},
    vfs::{ImageFile, VirtualFile, IMAGE_FILE_NAME},
};

use std::path::Path;
use tracing::{debug, info};

/// Factory for VDI containers
///
/// Holds the [`ContainerConfig`] applied to everything it opens or creates.
/// There is no process-wide registry; construct one where it is needed.
///
/// # Examples
///
/// ```rust,no_run
/// use vdi_container::{VdiFs, MemBacking};
///
/// # fn main() -> vdi_container::Result<()> {
/// let fs = VdiFs::new();
/// let container = fs.create_dynamic_in(MemBacking::new(), 1 << 20, 4096, "ram")?;
/// assert_eq!(container.allocated_blocks(), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct VdiFs {
    config: ContainerConfig,
}

impl VdiFs {
    /// Factory with the default configuration
    pub fn new() -> Self {
        VdiFs {
            config: ContainerConfig::default(),
        }
    }

    /// Factory with a validated configuration
    pub fn with_config(config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        Ok(VdiFs { config })
    }

    pub fn builder() -> VdiFsBuilder {
        VdiFsBuilder::new()
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Open an existing image held by `backing`
    pub fn open<B: BackingStore>(&self, backing: B) -> Result<Container<B>> {
        Container::open_with_config(backing, self.config.clone())
    }

    /// Open an image file on disk
    ///
    /// With `read_only` set, the file is opened without write access.
    pub fn open_path<P: AsRef<Path>>(&self, path: P) -> Result<Container<FileBacking>> {
        let path = path.as_ref();
        let backing = if self.config.read_only {
            FileBacking::open_read_only(path)?
        } else {
            FileBacking::open(path)?
        };
        debug!(path = %path.display(), read_only = self.config.read_only, "opening image file");
        self.open(backing)
    }

    /// Create a sparse image file at `path`, replacing any existing file
    pub fn create_dynamic<P: AsRef<Path>>(
        &self,
        path: P,
        disk_size: u64,
        block_size: u32,
        description: &str,
    ) -> Result<Container<FileBacking>> {
        let path = path.as_ref();
        info!(path = %path.display(), disk_size, block_size, "creating dynamic image");
        self.create_dynamic_in(FileBacking::create(path)?, disk_size, block_size, description)
    }

    /// Create a preallocated image file at `path`, replacing any existing file
    pub fn create_static<P: AsRef<Path>>(
        &self,
        path: P,
        disk_size: u64,
        block_size: u32,
        description: &str,
    ) -> Result<Container<FileBacking>> {
        let path = path.as_ref();
        info!(path = %path.display(), disk_size, block_size, "creating static image");
        self.create_static_in(FileBacking::create(path)?, disk_size, block_size, description)
    }

    /// Lay out a sparse image in an arbitrary backing store
    pub fn create_dynamic_in<B: BackingStore>(
        &self,
        backing: B,
        disk_size: u64,
        block_size: u32,
        description: &str,
    ) -> Result<Container<B>> {
        Container::create_dynamic(backing, disk_size, block_size, description, self.config.clone())
    }

    /// Lay out a preallocated image in an arbitrary backing store
    pub fn create_static_in<B: BackingStore>(
        &self,
        backing: B,
        disk_size: u64,
        block_size: u32,
        description: &str,
    ) -> Result<Container<B>> {
        Container::create_static(backing, disk_size, block_size, description, self.config.clone())
    }

    /// Present an open container as its single file
    pub fn mount<B: BackingStore>(&self, container: Container<B>) -> ImageFile<B> {
        ImageFile::new(container)
    }

    /// Open the image at `path` and present it as a file
    pub fn mount_path<P: AsRef<Path>>(&self, path: P) -> Result<ImageFile<FileBacking>> {
        Ok(self.mount(self.open_path(path)?))
    }
}

/// Builder for [`VdiFs`]
///
/// # Examples
///
/// ```rust,no_run
/// use vdi_container::VdiFsBuilder;
///
/// # fn main() -> vdi_container::Result<()> {
/// let fs = VdiFsBuilder::new()
///     .read_only(true)
///     .build()?;
/// let file = fs.mount_path("disk.vdi")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct VdiFsBuilder {
    config: ContainerConfig,
}

impl VdiFsBuilder {
    /// Create a new VdiFsBuilder with default settings
    pub fn new() -> Self {
        VdiFsBuilder {
            config: ContainerConfig::default(),
        }
    }

    /// Start from an existing configuration, e.g. one loaded from TOML
    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    /// Chunk size for zero-filling new blocks
    pub fn host_io_granularity(mut self, bytes: usize) -> Self {
        self.config.host_io_granularity = bytes;
        self
    }

    pub fn sync_on_close(mut self, enabled: bool) -> Self {
        self.config.sync_on_close = enabled;
        self
    }

    /// Refuse to grow a backing store past `bytes`
    pub fn max_backing_bytes(mut self, bytes: u64) -> Self {
        self.config.max_backing_bytes = Some(bytes);
        self
    }

    pub fn read_only(mut self, enabled: bool) -> Self {
        self.config.read_only = enabled;
        self
    }

    /// Validate the configuration and build the factory
    pub fn build(self) -> Result<VdiFs> {
        VdiFs::with_config(self.config)
    }
}
