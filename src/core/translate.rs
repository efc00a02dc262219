//! Logical-to-physical address translation
//!
//! Static images map affinely: `physical = block_offset + logical`.
//! Dynamic images go through the allocation table, one image block per
//! call. A request that crosses a block boundary is clipped at the boundary
//! and the caller reissues the remainder, which keeps every allocation a
//! single-block operation inside one critical section.

use crate::allocator::BlockAllocator;
use crate::error::{Result, VdiError};
use crate::header::{ContainerHeader, ImageType};
use crate::io::BackingStore;
use crate::table::{BlockAllocationTable, Slot};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// What the caller is about to do with the translated range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    Read,
    Write,
}

/// Where a logical range lives inside the container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalRange {
    /// `len` bytes stored at `offset` in the backing store
    Mapped { offset: u64, len: u64 },
    /// `len` bytes of a never-written block; reads as zeros
    Sparse { len: u64 },
}

impl PhysicalRange {
    pub fn len(&self) -> u64 {
        match *self {
            PhysicalRange::Mapped { len, .. } | PhysicalRange::Sparse { len } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, PhysicalRange::Sparse { .. })
    }

    /// Physical offset, if the range is backed by storage
    pub fn offset(&self) -> Option<u64> {
        match *self {
            PhysicalRange::Mapped { offset, .. } => Some(offset),
            PhysicalRange::Sparse { .. } => None,
        }
    }
}

/// Borrowed view over the parts of a container needed to translate
pub struct AddressTranslator<'a, B: ?Sized> {
    pub(crate) header: &'a ContainerHeader,
    pub(crate) table: Option<&'a BlockAllocationTable>,
    pub(crate) allocator: &'a Mutex<BlockAllocator>,
    pub(crate) backing: &'a B,
    /// Known extent of the backing store; raised when allocation grows it
    pub(crate) extent: &'a AtomicU64,
    pub(crate) read_only: bool,
}

impl<'a, B: BackingStore + ?Sized> AddressTranslator<'a, B> {
    /// Translate `length` bytes at `logical_offset`
    ///
    /// The returned range may be shorter than `length`: it stops at the end
    /// of the disk and, for dynamic images, at the end of the image block.
    /// Every Write-intent call on a read-only container fails with
    /// `ReadOnly`, whether or not the block is already mapped.
    pub fn translate(&self, logical_offset: u64, length: u64, intent: Intent) -> Result<PhysicalRange> {
        if self.read_only && intent == Intent::Write {
            return Err(VdiError::ReadOnly);
        }
        let disk_size = self.header.disk_size;
        if logical_offset >= disk_size {
            return Err(VdiError::OutOfRange {
                offset: logical_offset,
                len: length,
                limit: disk_size,
            });
        }
        let available = disk_size - logical_offset;

        match self.header.image_type {
            ImageType::Static => self.translate_static(logical_offset, length.min(available)),
            ImageType::Dynamic => self.translate_dynamic(logical_offset, length.min(available), intent),
        }
    }

    fn translate_static(&self, logical_offset: u64, len: u64) -> Result<PhysicalRange> {
        let offset = (self.header.block_offset as u64)
            .checked_add(logical_offset)
            .ok_or(VdiError::OutOfRange {
                offset: logical_offset,
                len,
                limit: self.header.disk_size,
            })?;
        self.check_extent(offset, len)?;
        Ok(PhysicalRange::Mapped { offset, len })
    }

    fn translate_dynamic(&self, logical_offset: u64, len: u64, intent: Intent) -> Result<PhysicalRange> {
        let table = self
            .table
            .ok_or(VdiError::CorruptTable("dynamic image without allocation table"))?;

        let block_size = self.header.block_size as u64;
        let index = u32::try_from(logical_offset / block_size).map_err(|_| VdiError::OutOfRange {
            offset: logical_offset,
            len,
            limit: self.header.disk_size,
        })?;
        let within = logical_offset % block_size;
        let len = len.min(block_size - within);

        let slot = match table.lookup(index)? {
            Slot::Allocated(slot) => slot,
            Slot::Unallocated => match intent {
                Intent::Read => return Ok(PhysicalRange::Sparse { len }),
                Intent::Write if len == 0 => return Ok(PhysicalRange::Sparse { len }),
                Intent::Write => self.allocate(table, index)?,
            },
        };

        let offset = (slot as u64)
            .checked_mul(block_size)
            .and_then(|v| v.checked_add(self.header.block_offset as u64))
            .and_then(|v| v.checked_add(within))
            .ok_or(VdiError::CorruptTable("slot offset overflows"))?;
        self.check_extent(offset, len)?;
        Ok(PhysicalRange::Mapped { offset, len })
    }

    /// Check-then-allocate, serialized by the allocation lock
    ///
    /// The lookup is repeated under the lock: when another writer allocated
    /// the block first, its slot is reused and nothing new is reserved.
    fn allocate(&self, table: &BlockAllocationTable, index: u32) -> Result<u32> {
        let mut allocator = self.allocator.lock();
        if let Slot::Allocated(slot) = table.lookup(index)? {
            debug!(index, slot, "block allocated by a concurrent writer");
            return Ok(slot);
        }

        let slot = allocator.allocate_next(self.backing)?;
        let slot_end = allocator.slot_offset(slot + 1)?;
        self.extent.fetch_max(slot_end, Ordering::AcqRel);
        let published = allocator
            .zero_initialize(self.backing, slot)
            .and_then(|()| table.assign(index, slot));
        if let Err(e) = published {
            allocator.rollback(slot);
            table.mark_dirty();
            warn!(index, slot, error = %e, "block allocation failed after growing the container");
            return Err(e);
        }

        debug!(index, slot, "allocated block");
        Ok(slot)
    }

    fn check_extent(&self, offset: u64, len: u64) -> Result<()> {
        let extent = self.extent.load(Ordering::Acquire);
        match offset.checked_add(len) {
            Some(end) if end <= extent => Ok(()),
            _ => Err(VdiError::OutOfRange {
                offset,
                len,
                limit: extent,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;
    use crate::io::MemBacking;

    struct Fixture {
        header: ContainerHeader,
        table: Option<BlockAllocationTable>,
        allocator: Mutex<BlockAllocator>,
        backing: MemBacking,
        extent: AtomicU64,
    }

    impl Fixture {
        fn dynamic(block_size: u32, blocks: u32) -> Self {
            let header =
                ContainerHeader::new_dynamic(block_size as u64 * blocks as u64, block_size, "").unwrap();
            let allocator = BlockAllocator::new(&header, &ContainerConfig::default());
            Fixture {
                table: Some(BlockAllocationTable::new_unallocated(blocks)),
                backing: MemBacking::from_vec(vec![0; header.block_offset as usize]),
                extent: AtomicU64::new(header.block_offset as u64),
                allocator: Mutex::new(allocator),
                header,
            }
        }

        fn fixed(block_size: u32, blocks: u32) -> Self {
            let header =
                ContainerHeader::new_static(block_size as u64 * blocks as u64, block_size, "").unwrap();
            let allocator = BlockAllocator::new(&header, &ContainerConfig::default());
            let len = header.block_offset as u64 + header.disk_size;
            Fixture {
                table: None,
                backing: MemBacking::from_vec(vec![0; len as usize]),
                extent: AtomicU64::new(len),
                allocator: Mutex::new(allocator),
                header,
            }
        }

        fn translator(&self) -> AddressTranslator<'_, MemBacking> {
            AddressTranslator {
                header: &self.header,
                table: self.table.as_ref(),
                allocator: &self.allocator,
                backing: &self.backing,
                extent: &self.extent,
                read_only: false,
            }
        }
    }

    #[test]
    fn test_static_is_affine() {
        let fx = Fixture::fixed(4096, 4);
        let base = fx.header.block_offset as u64;
        for offset in [0u64, 1, 4095, 4096, 10_000, 16_383] {
            let range = fx.translator().translate(offset, 1, Intent::Read).unwrap();
            assert_eq!(range, PhysicalRange::Mapped { offset: base + offset, len: 1 });
        }
    }

    #[test]
    fn test_static_clips_at_disk_end() {
        let fx = Fixture::fixed(4096, 2);
        let range = fx.translator().translate(8000, 1000, Intent::Write).unwrap();
        assert_eq!(range.len(), 192);
    }

    #[test]
    fn test_static_truncated_backing() {
        let fx = Fixture::fixed(4096, 2);
        fx.extent
            .store(fx.header.block_offset as u64 + 4096, Ordering::Release);
        assert!(fx.translator().translate(100, 10, Intent::Read).is_ok());
        assert!(matches!(
            fx.translator().translate(5000, 10, Intent::Read),
            Err(VdiError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_sparse_read_leaves_table_untouched() {
        let fx = Fixture::dynamic(4096, 4);
        let range = fx.translator().translate(5000, 100, Intent::Read).unwrap();
        assert_eq!(range, PhysicalRange::Sparse { len: 100 });
        assert!(!fx.table.as_ref().unwrap().is_dirty());
        assert_eq!(fx.allocator.lock().allocated_count(), 0);
    }

    #[test]
    fn test_first_write_gets_slot_zero() {
        let fx = Fixture::dynamic(4096, 4);
        let base = fx.header.block_offset as u64;

        let range = fx.translator().translate(3 * 4096 + 10, 5, Intent::Write).unwrap();
        assert_eq!(range, PhysicalRange::Mapped { offset: base + 10, len: 5 });

        let range = fx.translator().translate(4096, 5, Intent::Write).unwrap();
        assert_eq!(range, PhysicalRange::Mapped { offset: base + 4096, len: 5 });
        assert_eq!(fx.extent.load(Ordering::Acquire), base + 2 * 4096);

        let table = fx.table.as_ref().unwrap();
        assert_eq!(table.lookup(3).unwrap(), Slot::Allocated(0));
        assert_eq!(table.lookup(1).unwrap(), Slot::Allocated(1));
        assert!(table.is_dirty());
    }

    #[test]
    fn test_clipped_at_block_boundary() {
        let fx = Fixture::dynamic(4096, 4);
        let range = fx.translator().translate(4000, 1000, Intent::Read).unwrap();
        assert_eq!(range.len(), 96);
    }

    #[test]
    fn test_zero_length_write_does_not_allocate() {
        let fx = Fixture::dynamic(4096, 4);
        let range = fx.translator().translate(0, 0, Intent::Write).unwrap();
        assert!(range.is_sparse());
        assert!(range.is_empty());
        assert_eq!(fx.allocator.lock().allocated_count(), 0);
    }

    #[test]
    fn test_read_only_refuses_allocation() {
        let fx = Fixture::dynamic(4096, 4);
        let mut translator = fx.translator();
        translator.read_only = true;
        assert!(matches!(
            translator.translate(0, 1, Intent::Write),
            Err(VdiError::ReadOnly)
        ));
        assert!(translator.translate(0, 1, Intent::Read).unwrap().is_sparse());
        assert_eq!(fx.allocator.lock().allocated_count(), 0);
    }

    #[test]
    fn test_read_only_refuses_write_to_mapped_block() {
        let fx = Fixture::dynamic(4096, 4);
        let mapped = fx.translator().translate(4096, 1, Intent::Write).unwrap();

        let mut translator = fx.translator();
        translator.read_only = true;
        assert!(matches!(
            translator.translate(4096, 1, Intent::Write),
            Err(VdiError::ReadOnly)
        ));
        assert_eq!(translator.translate(4096, 1, Intent::Read).unwrap(), mapped);
    }

    #[test]
    fn test_read_only_static_refuses_write() {
        let fx = Fixture::fixed(4096, 2);
        let mut translator = fx.translator();
        translator.read_only = true;
        assert!(matches!(
            translator.translate(0, 1, Intent::Write),
            Err(VdiError::ReadOnly)
        ));
        assert!(translator.translate(0, 1, Intent::Read).is_ok());
    }

    /// Counts extent queries
    struct CountingBacking {
        inner: MemBacking,
        len_calls: std::sync::atomic::AtomicUsize,
    }

    impl BackingStore for CountingBacking {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.read_at(offset, buf)
        }

        fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
            self.inner.write_at(offset, data)
        }

        fn len(&self) -> Result<u64> {
            self.len_calls.fetch_add(1, Ordering::Relaxed);
            self.inner.len()
        }

        fn set_len(&self, len: u64) -> Result<()> {
            self.inner.set_len(len)
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_mapped_lookups_do_not_query_extent() {
        let fx = Fixture::dynamic(4096, 4);
        let backing = CountingBacking {
            inner: MemBacking::from_vec(vec![0; fx.header.block_offset as usize]),
            len_calls: std::sync::atomic::AtomicUsize::new(0),
        };
        let translator = AddressTranslator {
            header: &fx.header,
            table: fx.table.as_ref(),
            allocator: &fx.allocator,
            backing: &backing,
            extent: &fx.extent,
            read_only: false,
        };

        translator.translate(0, 1, Intent::Write).unwrap();
        let after_alloc = backing.len_calls.load(Ordering::Relaxed);
        for offset in (0..4096).step_by(64) {
            translator.translate(offset, 64, Intent::Read).unwrap();
            translator.translate(offset, 64, Intent::Write).unwrap();
        }
        assert_eq!(backing.len_calls.load(Ordering::Relaxed), after_alloc);
    }
}
