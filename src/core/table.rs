//! Block allocation table
//!
//! In-memory mirror of the on-disk array that maps each logical block of a
//! dynamic image to a physical slot in the container's data region. Entries
//! are signed 32-bit little-endian values; any negative value means the
//! block has never been written.
//!
//! Entries are atomics so that lookups of already-allocated blocks never
//! take a lock. [`BlockAllocationTable::assign`] publishes a slot with
//! release ordering: a reader that observes the slot also observes the
//! zero-fill that preceded the assignment.

use crate::error::{Result, VdiError};
use crate::header::TABLE_ENTRY_LEN;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Value written for blocks that have no physical slot yet
pub const UNALLOCATED: i32 = -1;

/// Result of a table lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Physical slot index within the data region
    Allocated(u32),
    Unallocated,
}

impl Slot {
    fn from_raw(raw: i32) -> Self {
        if raw < 0 {
            Slot::Unallocated
        } else {
            Slot::Allocated(raw as u32)
        }
    }
}

#[derive(Debug)]
pub struct BlockAllocationTable {
    entries: Box<[AtomicI32]>,
    dirty: AtomicBool,
}

impl BlockAllocationTable {
    /// Table for a fresh image: every block unallocated
    pub fn new_unallocated(count: u32) -> Self {
        let entries = (0..count).map(|_| AtomicI32::new(UNALLOCATED)).collect();
        BlockAllocationTable {
            entries,
            dirty: AtomicBool::new(false),
        }
    }

    /// Decode `count` little-endian entries from `raw`
    pub fn load(raw: &[u8], count: u32) -> Result<Self> {
        let needed = count as usize * TABLE_ENTRY_LEN;
        if raw.len() < needed {
            return Err(VdiError::CorruptTable("allocation table truncated"));
        }

        let entries = raw[..needed]
            .chunks_exact(TABLE_ENTRY_LEN)
            .map(|chunk| AtomicI32::new(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
            .collect();

        Ok(BlockAllocationTable {
            entries,
            dirty: AtomicBool::new(false),
        })
    }

    /// Check the dense-slot invariant against the header's allocated count
    ///
    /// Every assigned slot must be below `allocated` and no slot may be
    /// referenced twice.
    pub fn validate(&self, allocated: u32) -> Result<()> {
        let mut seen = vec![false; allocated as usize];
        for entry in self.entries.iter() {
            if let Slot::Allocated(slot) = Slot::from_raw(entry.load(Ordering::Relaxed)) {
                let seen_slot = seen
                    .get_mut(slot as usize)
                    .ok_or(VdiError::CorruptTable("slot beyond allocated count"))?;
                if *seen_slot {
                    return Err(VdiError::CorruptTable("slot assigned to more than one block"));
                }
                *seen_slot = true;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, index: u32) -> Result<Slot> {
        let entry = self.entry(index)?;
        Ok(Slot::from_raw(entry.load(Ordering::Acquire)))
    }

    /// Point `index` at `slot` and mark the table dirty
    ///
    /// Fails with `AlreadyAssigned` when the entry already holds a slot; the
    /// existing assignment is left untouched.
    pub fn assign(&self, index: u32, slot: u32) -> Result<()> {
        let raw_slot =
            i32::try_from(slot).map_err(|_| VdiError::CorruptTable("slot exceeds table range"))?;
        let entry = self.entry(index)?;

        let mut current = entry.load(Ordering::Acquire);
        loop {
            if current >= 0 {
                return Err(VdiError::AlreadyAssigned {
                    index,
                    slot: current as u32,
                });
            }
            match entry.compare_exchange(current, raw_slot, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.mark_dirty();
        Ok(())
    }

    /// Encode the table in its on-disk layout
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.entries.len() * TABLE_ENTRY_LEN);
        for entry in self.entries.iter() {
            bytes.extend_from_slice(&entry.load(Ordering::Acquire).to_le_bytes());
        }
        bytes
    }

    /// Number of blocks that currently hold a slot
    pub fn assigned_count(&self) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.load(Ordering::Relaxed) >= 0)
            .count() as u32
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    fn entry(&self, index: u32) -> Result<&AtomicI32> {
        self.entries.get(index as usize).ok_or(VdiError::OutOfRange {
            offset: index as u64,
            len: 1,
            limit: self.entries.len() as u64,
        })
    }
}
