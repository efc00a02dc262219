use crate::error::{Result, VdiError};
use serde::{Deserialize, Serialize};

/// Length of the NUL-padded preamble text at offset 0
pub const PREAMBLE_LEN: usize = 64;
/// Length of the fixed header, preamble included
pub const HEADER_LEN: usize = 168;
pub const SIGNATURE: u32 = 0xBEDA_107F;
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 1;
pub const DESCRIPTION_LEN: usize = 32;
pub const DEFAULT_SECTOR_SIZE: u32 = 512;
/// Where new images place the allocation table
pub const DEFAULT_MAP_OFFSET: u32 = 512;
/// Byte offset of the allocated-block counter
pub const ALLOCATED_BLOCKS_OFFSET: u64 = 164;
/// Size of one allocation-table entry
pub const TABLE_ENTRY_LEN: usize = 4;

/// Preamble strings written by the known producers of the format.
///
/// The text differs between vendors, so each one is matched exactly rather
/// than relying on any single string.
pub const PREAMBLES: [&str; 4] = [
    "<<< Oracle VM VirtualBox Disk Image >>>\n",
    "<<< Sun xVM VirtualBox Disk Image >>>\n",
    "<<< Sun VirtualBox Disk Image >>>\n",
    "<<< innotek VirtualBox Disk Image >>>\n",
];

/// Image layout variant
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageType {
    /// Sparse image: blocks are allocated on first write
    Dynamic = 1,
    /// Fully preallocated image: logical offsets map affinely
    Static = 2,
}

impl ImageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Dynamic),
            2 => Some(Self::Static),
            _ => None,
        }
    }
}

/// Fixed-layout container header
///
/// Only `allocated_blocks` ever changes after creation; see
/// [`ContainerHeader::allocated_patch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub magic: [u8; PREAMBLE_LEN],
    pub signature: u32,
    pub version_minor: u16,
    pub version_major: u16,
    pub header_size: u32,
    pub image_type: ImageType,
    pub flags: u32,
    pub description: [u8; DESCRIPTION_LEN],
    /// Byte offset of the allocation table
    pub map_offset: u32,
    /// Byte offset of the first data block
    pub block_offset: u32,
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
    pub sector_size: u32,
    pub reserved: u32,
    /// Size of the represented virtual disk
    pub disk_size: u64,
    /// Allocation granularity
    pub block_size: u32,
    pub block_extra: u32,
    pub block_count: u32,
    pub allocated_blocks: u32,
}

/// In-place rewrite of part of the on-disk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPatch {
    pub offset: u64,
    pub bytes: [u8; 4],
}

impl ContainerHeader {
    /// Header for a new sparse image with every block unallocated
    pub fn new_dynamic(disk_size: u64, block_size: u32, description: &str) -> Result<Self> {
        Self::new(ImageType::Dynamic, disk_size, block_size, description)
    }

    /// Header for a new preallocated image
    pub fn new_static(disk_size: u64, block_size: u32, description: &str) -> Result<Self> {
        Self::new(ImageType::Static, disk_size, block_size, description)
    }

    fn new(image_type: ImageType, disk_size: u64, block_size: u32, description: &str) -> Result<Self> {
        if block_size == 0 {
            return Err(VdiError::InvalidConfig("block size must be non-zero".into()));
        }
        if disk_size == 0 || disk_size % block_size as u64 != 0 {
            return Err(VdiError::InvalidConfig(format!(
                "disk size {} is not a non-zero multiple of block size {}",
                disk_size, block_size
            )));
        }
        let block_count = disk_size / block_size as u64;
        if block_count > i32::MAX as u64 {
            return Err(VdiError::InvalidConfig(format!(
                "{} blocks exceed the allocation table range",
                block_count
            )));
        }
        let block_count = block_count as u32;

        let table_end = DEFAULT_MAP_OFFSET as u64 + block_count as u64 * TABLE_ENTRY_LEN as u64;
        let block_offset = table_end.div_ceil(DEFAULT_SECTOR_SIZE as u64) * DEFAULT_SECTOR_SIZE as u64;
        let block_offset = u32::try_from(block_offset)
            .map_err(|_| VdiError::InvalidConfig("allocation table too large".into()))?;

        let mut magic = [0u8; PREAMBLE_LEN];
        magic[..PREAMBLES[0].len()].copy_from_slice(PREAMBLES[0].as_bytes());

        // Keep a trailing NUL so readers that treat it as a C string stop in bounds.
        let mut desc = [0u8; DESCRIPTION_LEN];
        let text = description.as_bytes();
        let n = text.len().min(DESCRIPTION_LEN - 1);
        desc[..n].copy_from_slice(&text[..n]);

        let allocated_blocks = match image_type {
            ImageType::Dynamic => 0,
            ImageType::Static => block_count,
        };

        Ok(ContainerHeader {
            magic,
            signature: SIGNATURE,
            version_minor: VERSION_MINOR,
            version_major: VERSION_MAJOR,
            header_size: (HEADER_LEN - PREAMBLE_LEN) as u32,
            image_type,
            flags: 0,
            description: desc,
            map_offset: DEFAULT_MAP_OFFSET,
            block_offset,
            cylinders: 0,
            heads: 0,
            sectors: 0,
            sector_size: DEFAULT_SECTOR_SIZE,
            reserved: 0,
            disk_size,
            block_size,
            block_extra: 0,
            block_count,
            allocated_blocks,
        })
    }

    /// Decode and validate a header
    ///
    /// Checks run in order: length, preamble, signature, version, image type,
    /// block size, size consistency, then region layout.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(VdiError::CorruptHeader("header truncated"));
        }

        let mut magic = [0u8; PREAMBLE_LEN];
        magic.copy_from_slice(&bytes[..PREAMBLE_LEN]);
        if !preamble_matches(&magic) {
            return Err(VdiError::CorruptHeader("preamble mismatch"));
        }

        let signature = le_u32(&bytes[64..68]);
        if signature != SIGNATURE {
            return Err(VdiError::CorruptHeader("signature mismatch"));
        }

        let version_minor = le_u16(&bytes[68..70]);
        let version_major = le_u16(&bytes[70..72]);
        if version_major != VERSION_MAJOR || version_minor != VERSION_MINOR {
            return Err(VdiError::UnsupportedVersion {
                major: version_major,
                minor: version_minor,
            });
        }

        let image_type = ImageType::from_u32(le_u32(&bytes[76..80]))
            .ok_or(VdiError::CorruptHeader("unknown image type"))?;

        let mut description = [0u8; DESCRIPTION_LEN];
        description.copy_from_slice(&bytes[84..116]);

        let header = ContainerHeader {
            magic,
            signature,
            version_minor,
            version_major,
            header_size: le_u32(&bytes[72..76]),
            image_type,
            flags: le_u32(&bytes[80..84]),
            description,
            map_offset: le_u32(&bytes[116..120]),
            block_offset: le_u32(&bytes[120..124]),
            cylinders: le_u32(&bytes[124..128]),
            heads: le_u32(&bytes[128..132]),
            sectors: le_u32(&bytes[132..136]),
            sector_size: le_u32(&bytes[136..140]),
            reserved: le_u32(&bytes[140..144]),
            disk_size: le_u64(&bytes[144..152]),
            block_size: le_u32(&bytes[152..156]),
            block_extra: le_u32(&bytes[156..160]),
            block_count: le_u32(&bytes[160..164]),
            allocated_blocks: le_u32(&bytes[164..168]),
        };

        header.validate()?;
        Ok(header)
    }

    /// Structural checks shared by `parse` and image creation
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(VdiError::CorruptHeader("block size is zero"));
        }

        let computed = (self.block_count as u64).checked_mul(self.block_size as u64);
        if computed != Some(self.disk_size) {
            return Err(VdiError::SizeMismatch {
                block_count: self.block_count,
                block_size: self.block_size,
                declared: self.disk_size,
            });
        }

        if self.allocated_blocks > self.block_count {
            return Err(VdiError::CorruptHeader("allocated blocks exceed block count"));
        }
        if (self.block_offset as usize) < HEADER_LEN {
            return Err(VdiError::CorruptHeader("data region overlaps header"));
        }

        if self.image_type == ImageType::Dynamic {
            if self.block_count > i32::MAX as u32 {
                return Err(VdiError::CorruptHeader("block count exceeds table range"));
            }
            if (self.map_offset as usize) < HEADER_LEN {
                return Err(VdiError::CorruptHeader("allocation table overlaps header"));
            }
            if self.table_end() > self.block_offset as u64 {
                return Err(VdiError::CorruptHeader("allocation table overlaps data region"));
            }
        }

        Ok(())
    }

    /// Serialize the full fixed header
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN);

        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.signature.to_le_bytes());
        bytes.extend_from_slice(&self.version_minor.to_le_bytes());
        bytes.extend_from_slice(&self.version_major.to_le_bytes());
        bytes.extend_from_slice(&self.header_size.to_le_bytes());
        bytes.extend_from_slice(&(self.image_type as u32).to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.description);
        bytes.extend_from_slice(&self.map_offset.to_le_bytes());
        bytes.extend_from_slice(&self.block_offset.to_le_bytes());
        bytes.extend_from_slice(&self.cylinders.to_le_bytes());
        bytes.extend_from_slice(&self.heads.to_le_bytes());
        bytes.extend_from_slice(&self.sectors.to_le_bytes());
        bytes.extend_from_slice(&self.sector_size.to_le_bytes());
        bytes.extend_from_slice(&self.reserved.to_le_bytes());
        bytes.extend_from_slice(&self.disk_size.to_le_bytes());
        bytes.extend_from_slice(&self.block_size.to_le_bytes());
        bytes.extend_from_slice(&self.block_extra.to_le_bytes());
        bytes.extend_from_slice(&self.block_count.to_le_bytes());
        bytes.extend_from_slice(&self.allocated_blocks.to_le_bytes());

        debug_assert_eq!(bytes.len(), HEADER_LEN);
        bytes
    }

    /// Minimal rewrite carrying a new allocated-block count
    pub fn allocated_patch(allocated_count: u32) -> HeaderPatch {
        HeaderPatch {
            offset: ALLOCATED_BLOCKS_OFFSET,
            bytes: allocated_count.to_le_bytes(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.image_type == ImageType::Dynamic
    }

    /// On-disk size of the allocation table
    pub fn table_len(&self) -> u64 {
        self.block_count as u64 * TABLE_ENTRY_LEN as u64
    }

    /// First byte past the allocation table
    pub fn table_end(&self) -> u64 {
        self.map_offset as u64 + self.table_len()
    }

    /// Description text up to the first NUL
    pub fn description_text(&self) -> String {
        nul_terminated(&self.description)
    }

    /// Preamble text up to the first NUL
    pub fn preamble_text(&self) -> String {
        nul_terminated(&self.magic)
    }
}

fn preamble_matches(magic: &[u8; PREAMBLE_LEN]) -> bool {
    let end = magic.iter().position(|b| *b == 0).unwrap_or(PREAMBLE_LEN);
    PREAMBLES.iter().any(|p| p.as_bytes() == &magic[..end])
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
