//! Append-only block allocation for dynamic images
//!
//! Slots are handed out densely: slot `k` is always the `k+1`-th block ever
//! appended, and nothing is reclaimed. Allocating a slot grows the backing
//! store to cover it; the slot is then zero-filled before the caller exposes
//! it through the allocation table.

use crate::config::ContainerConfig;
use crate::error::{Result, VdiError};
use crate::header::ContainerHeader;
use crate::io::BackingStore;
use tracing::debug;

/// Next-free-slot counter plus the geometry needed to place slots
///
/// Not synchronized on its own; the container holds it behind the
/// allocation lock.
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    block_offset: u64,
    block_size: u64,
    block_count: u32,
    allocated: u32,
    host_io_granularity: usize,
    max_backing_bytes: Option<u64>,
}

impl BlockAllocator {
    pub fn new(header: &ContainerHeader, config: &ContainerConfig) -> Self {
        BlockAllocator {
            block_offset: header.block_offset as u64,
            block_size: header.block_size as u64,
            block_count: header.block_count,
            allocated: header.allocated_blocks,
            host_io_granularity: config.host_io_granularity.max(1),
            max_backing_bytes: config.max_backing_bytes,
        }
    }

    /// Number of slots handed out so far
    pub fn allocated_count(&self) -> u32 {
        self.allocated
    }

    /// Byte offset of the start of `slot`
    pub fn slot_offset(&self, slot: u32) -> Result<u64> {
        (slot as u64)
            .checked_mul(self.block_size)
            .and_then(|v| v.checked_add(self.block_offset))
            .ok_or(VdiError::OutOfRange {
                offset: slot as u64,
                len: self.block_size,
                limit: u64::MAX,
            })
    }

    /// Reserve the next slot, growing the backing store to cover it
    ///
    /// The store is grown to `block_offset + (allocated + 1) * block_size`
    /// bytes; a store that is already larger is left alone. Any growth
    /// failure is reported as `AllocationExhausted` and leaves the counter
    /// unchanged.
    pub fn allocate_next<B: BackingStore + ?Sized>(&mut self, backing: &B) -> Result<u32> {
        let slot = self.allocated;
        let required = (slot as u64 + 1)
            .checked_mul(self.block_size)
            .and_then(|v| v.checked_add(self.block_offset))
            .ok_or_else(|| VdiError::exhausted(u64::MAX, None))?;

        if slot >= self.block_count {
            return Err(VdiError::exhausted(required, None));
        }
        if let Some(max) = self.max_backing_bytes {
            if required > max {
                return Err(VdiError::exhausted(required, None));
            }
        }

        let current = backing.len()?;
        if current < required {
            backing
                .set_len(required)
                .map_err(|e| VdiError::exhausted(required, Some(e)))?;
        }

        self.allocated += 1;
        debug!(slot, required, "reserved block slot");
        Ok(slot)
    }

    /// Zero the full extent of `slot` in `host_io_granularity` chunks
    pub fn zero_initialize<B: BackingStore + ?Sized>(&self, backing: &B, slot: u32) -> Result<()> {
        let offset = self.slot_offset(slot)?;
        zero_fill(backing, offset, self.block_size, self.host_io_granularity)
    }

    /// Hand back a slot whose initialization failed
    ///
    /// Only the most recently reserved slot can be returned; the next
    /// allocation reuses and re-zeroes it.
    pub fn rollback(&mut self, slot: u32) {
        if self.allocated > 0 && slot == self.allocated - 1 {
            self.allocated -= 1;
        }
    }
}

/// Write `len` zero bytes at `offset`, `granularity` bytes per call
///
/// When `len` is not a multiple of `granularity` the last write is the
/// remainder. Stops at the first failed write.
pub fn zero_fill<B: BackingStore + ?Sized>(
    backing: &B,
    mut offset: u64,
    mut len: u64,
    granularity: usize,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let chunk = (granularity.max(1) as u64).min(len) as usize;
    let zeros = vec![0u8; chunk];

    while len > 0 {
        let n = (len.min(chunk as u64)) as usize;
        backing.write_at(offset, &zeros[..n])?;
        offset = offset
            .checked_add(n as u64)
            .ok_or(VdiError::OutOfRange {
                offset,
                len,
                limit: u64::MAX,
            })?;
        len -= n as u64;
    }
    Ok(())
}
