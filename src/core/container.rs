//! Container lifecycle
//!
//! [`Container`] owns the decoded header, the allocation table of a dynamic
//! image, the allocation lock and the backing store. It is the only object a
//! host integration needs: open it, route reads and writes through
//! [`Container::translate`], call [`Container::sync`] for durability and
//! [`Container::close`] when done.

use crate::allocator::BlockAllocator;
use crate::config::ContainerConfig;
use crate::error::{Result, VdiError};
use crate::header::{ContainerHeader, ImageType, HEADER_LEN};
use crate::io::BackingStore;
use crate::table::BlockAllocationTable;
use crate::translate::{AddressTranslator, Intent, PhysicalRange};
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use tracing::{debug, info};

/// An open VDI container
///
/// All operations take `&self`; a container can be shared between threads
/// when its backing store can. Block allocation is serialized by an internal
/// lock, lookups of allocated blocks are lock-free, and `sync` waits for any
/// in-flight allocation to finish.
pub struct Container<B: BackingStore> {
    backing: B,
    header: ContainerHeader,
    table: Option<BlockAllocationTable>,
    allocator: Mutex<BlockAllocator>,
    extent: AtomicU64,
    config: ContainerConfig,
}

impl<B: BackingStore> Container<B> {
    /// Open a container with the default configuration
    pub fn open(backing: B) -> Result<Self> {
        Self::open_with_config(backing, ContainerConfig::default())
    }

    /// Decode the header and, for dynamic images, load the allocation table
    ///
    /// On failure the backing store is dropped along with everything read
    /// from it.
    pub fn open_with_config(backing: B, config: ContainerConfig) -> Result<Self> {
        config.validate()?;

        let len = backing.len()?;
        if len < HEADER_LEN as u64 {
            return Err(VdiError::CorruptHeader("container smaller than header"));
        }
        let mut raw = [0u8; HEADER_LEN];
        backing.read_at(0, &mut raw)?;
        let header = ContainerHeader::parse(&raw)?;

        let table = match header.image_type {
            ImageType::Dynamic => Some(load_table(&backing, &header, len)?),
            ImageType::Static => None,
        };

        info!(
            image_type = ?header.image_type,
            disk_size = header.disk_size,
            block_size = header.block_size,
            block_count = header.block_count,
            allocated = header.allocated_blocks,
            "opened container"
        );

        let allocator = Mutex::new(BlockAllocator::new(&header, &config));
        Ok(Container {
            backing,
            header,
            table,
            allocator,
            extent: AtomicU64::new(len),
            config,
        })
    }

    /// Lay out a new sparse image in `backing` and open it
    ///
    /// Any existing content of `backing` is discarded.
    pub fn create_dynamic(
        backing: B,
        disk_size: u64,
        block_size: u32,
        description: &str,
        config: ContainerConfig,
    ) -> Result<Self> {
        let header = ContainerHeader::new_dynamic(disk_size, block_size, description)?;
        let table = BlockAllocationTable::new_unallocated(header.block_count);
        Self::create(backing, header, table.serialize(), config)
    }

    /// Lay out a new preallocated image in `backing` and open it
    ///
    /// The data region is sized to the full disk; the table is written as the
    /// identity map for tools that expect one.
    pub fn create_static(
        backing: B,
        disk_size: u64,
        block_size: u32,
        description: &str,
        config: ContainerConfig,
    ) -> Result<Self> {
        let header = ContainerHeader::new_static(disk_size, block_size, description)?;
        let identity: Vec<u8> = (0..header.block_count as i32)
            .flat_map(|slot| slot.to_le_bytes())
            .collect();
        Self::create(backing, header, identity, config)
    }

    fn create(backing: B, header: ContainerHeader, table: Vec<u8>, config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        header.validate()?;

        let data_len = match header.image_type {
            ImageType::Dynamic => 0,
            ImageType::Static => header.disk_size,
        };
        let len = (header.block_offset as u64)
            .checked_add(data_len)
            .ok_or(VdiError::InvalidConfig("image too large".into()))?;

        backing.set_len(0)?;
        backing.set_len(len)?;
        backing.write_at(0, &header.to_bytes())?;
        backing.write_at(header.map_offset as u64, &table)?;
        backing.flush()?;

        info!(
            image_type = ?header.image_type,
            disk_size = header.disk_size,
            block_size = header.block_size,
            "created container"
        );
        Self::open_with_config(backing, config)
    }

    /// Translate a logical range of the virtual disk
    ///
    /// See [`AddressTranslator::translate`]. A Write-intent call on an
    /// unallocated block of a dynamic image allocates and zero-fills it.
    pub fn translate(&self, logical_offset: u64, length: u64, intent: Intent) -> Result<PhysicalRange> {
        self.translator().translate(logical_offset, length, intent)
    }

    /// Size of the represented virtual disk
    pub fn declared_size_bytes(&self) -> u64 {
        self.header.disk_size
    }

    /// Header as it would be written now
    pub fn header(&self) -> ContainerHeader {
        let mut header = self.header.clone();
        header.allocated_blocks = self.allocated_blocks();
        header
    }

    pub fn image_type(&self) -> ImageType {
        self.header.image_type
    }

    /// Number of physical slots handed out
    pub fn allocated_blocks(&self) -> u32 {
        self.allocator.lock().allocated_count()
    }

    /// Allocation table of a dynamic image
    pub fn table(&self) -> Option<&BlockAllocationTable> {
        self.table.as_ref()
    }

    /// True when allocation state has changed since the last sync
    pub fn is_dirty(&self) -> bool {
        self.table.as_ref().is_some_and(|t| t.is_dirty())
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Persist the allocated-block count and the allocation table
    ///
    /// The count is made durable before the table is written, so a sync torn
    /// by a crash leaves a table that references no slot beyond the count.
    /// No-op for static images and for clean containers. On failure the
    /// container stays dirty; retrying is up to the caller.
    pub fn sync(&self) -> Result<()> {
        let table = match &self.table {
            Some(table) => table,
            None => return Ok(()),
        };

        let allocator = self.allocator.lock();
        if !table.is_dirty() {
            return Ok(());
        }

        let allocated = allocator.allocated_count();
        let patch = ContainerHeader::allocated_patch(allocated);
        self.backing.write_at(patch.offset, &patch.bytes)?;
        self.backing.flush()?;
        self.backing
            .write_at(self.header.map_offset as u64, &table.serialize())?;
        self.backing.flush()?;
        table.clear_dirty();

        debug!(allocated, "synced allocation table");
        Ok(())
    }

    /// Release the container and hand back its backing store
    ///
    /// A dirty container is synced first when `sync_on_close` is set. Call
    /// [`Container::sync`] beforehand to observe sync errors while the
    /// container is still usable.
    pub fn close(self) -> Result<B> {
        if self.config.sync_on_close && self.is_dirty() {
            self.sync()?;
        }
        info!(allocated = self.allocated_blocks(), "closed container");
        Ok(self.backing)
    }

    fn translator(&self) -> AddressTranslator<'_, B> {
        AddressTranslator {
            header: &self.header,
            table: self.table.as_ref(),
            allocator: &self.allocator,
            backing: &self.backing,
            extent: &self.extent,
            read_only: self.config.read_only,
        }
    }
}

fn load_table<B: BackingStore>(backing: &B, header: &ContainerHeader, len: u64) -> Result<BlockAllocationTable> {
    if header.table_end() > len {
        return Err(VdiError::CorruptTable("allocation table truncated"));
    }
    let table_len = usize::try_from(header.table_len())
        .map_err(|_| VdiError::CorruptTable("allocation table too large"))?;

    let mut raw = vec![0u8; table_len];
    backing.read_at(header.map_offset as u64, &mut raw)?;

    let table = BlockAllocationTable::load(&raw, header.block_count)?;
    table.validate(header.allocated_blocks)?;
    Ok(table)
}
