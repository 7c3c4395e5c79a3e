//! Superblock (block 0) and on-disk geometry
//!
//! ```text
//! ┌───────────────────────────────┐ block 0
//! │ Superblock                    │
//! ├───────────────────────────────┤ block 1
//! │ Block bitmap                  │ ceil(block_count / (BLOCK_SIZE * 8)) blocks
//! ├───────────────────────────────┤
//! │ Inode table                   │ inode_count / INODES_PER_BLOCK blocks
//! ├───────────────────────────────┤ data_start()
//! │ Data region                   │ [tree blocks][data blocks] per blob
//! └───────────────────────────────┘ block_count
//! ```

use crate::error::{BlobfsError, Result};
use crate::inode::INODE_SIZE;
use serde::Serialize;

pub const MAGIC0: u64 = 0xac21_5347_9e69_4d21;
pub const MAGIC1: u64 = 0x9850_00d4_d4d3_d314;
pub const VERSION: u32 = 1;
pub const BLOCK_SIZE: usize = 8192;

/// Bits tracked by one bitmap block
pub const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;

/// Inode records stored in one inode table block
pub const INODES_PER_BLOCK: u64 = (BLOCK_SIZE / INODE_SIZE) as u64;

/// Block number of the superblock
pub const SUPERBLOCK_BLOCK: u64 = 0;

/// Block number of the first bitmap block
pub const BITMAP_START: u64 = 1;

/// Bytes of the superblock that carry fields; the rest of block 0 is zero
pub const SUPERBLOCK_DISK_SIZE: usize = 64;

/// Filesystem superblock
///
/// Occupies the first block of the device. The two allocation counters are
/// maintained by the engine in lockstep with every commit and free, and are
/// audited by the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Superblock {
    pub magic0: u64,
    pub magic1: u64,
    pub version: u32,

    /// Block size in bytes (always 8192)
    pub block_size: u32,

    /// Total blocks on the device, header region included
    pub block_count: u64,

    /// Capacity of the inode table
    pub inode_count: u64,

    /// Data blocks owned by committed blobs
    pub alloc_block_count: u64,

    /// Committed inodes
    pub alloc_inode_count: u64,

    /// Reserved for chaining additional superblocks; must be zero
    pub chain_pointer: u64,
}

impl Superblock {
    pub fn new(block_count: u64, inode_count: u64) -> Self {
        Superblock {
            magic0: MAGIC0,
            magic1: MAGIC1,
            version: VERSION,
            block_size: BLOCK_SIZE as u32,
            block_count,
            inode_count,
            alloc_block_count: 0,
            alloc_inode_count: 0,
            chain_pointer: 0,
        }
    }

    pub fn bitmap_blocks(&self) -> u64 {
        self.block_count.div_ceil(BITS_PER_BLOCK)
    }

    pub fn inode_table_start(&self) -> u64 {
        BITMAP_START + self.bitmap_blocks()
    }

    pub fn inode_table_blocks(&self) -> u64 {
        self.inode_count / INODES_PER_BLOCK
    }

    /// First block of the data region
    ///
    /// Everything below this block (superblock, bitmap, inode table) is the
    /// reserved header region and is permanently marked in the bitmap.
    pub fn data_start(&self) -> u64 {
        self.inode_table_start() + self.inode_table_blocks()
    }

    pub fn data_blocks(&self) -> u64 {
        self.block_count.saturating_sub(self.data_start())
    }

    /// Data blocks not owned by any committed blob
    pub fn free_data_blocks(&self) -> u64 {
        self.data_blocks().saturating_sub(self.alloc_block_count)
    }

    /// Check magic, version, and internal geometry
    pub fn validate(&self) -> Result<()> {
        if self.magic0 != MAGIC0 || self.magic1 != MAGIC1 {
            return Err(BlobfsError::invalid("bad superblock magic"));
        }

        if self.version != VERSION {
            return Err(BlobfsError::invalid(format!(
                "unsupported format version {}",
                self.version
            )));
        }

        if self.block_size as usize != BLOCK_SIZE {
            return Err(BlobfsError::invalid(format!(
                "unsupported block size {}",
                self.block_size
            )));
        }

        if self.chain_pointer != 0 {
            return Err(BlobfsError::invalid(format!(
                "nonzero superblock chain pointer {}",
                self.chain_pointer
            )));
        }

        if self.inode_count == 0 || self.inode_count % INODES_PER_BLOCK != 0 {
            return Err(BlobfsError::invalid(format!(
                "inode count {} does not fill whole blocks of {}",
                self.inode_count, INODES_PER_BLOCK
            )));
        }

        if self.data_start() >= self.block_count {
            return Err(BlobfsError::invalid(format!(
                "no data region: header needs {} of {} blocks",
                self.data_start(),
                self.block_count
            )));
        }

        if self.alloc_block_count > self.data_blocks() {
            return Err(BlobfsError::invalid(format!(
                "allocated blocks ({}) exceed data blocks ({})",
                self.alloc_block_count,
                self.data_blocks()
            )));
        }

        if self.alloc_inode_count > self.inode_count {
            return Err(BlobfsError::invalid(format!(
                "allocated inodes ({}) exceed inode count ({})",
                self.alloc_inode_count, self.inode_count
            )));
        }

        Ok(())
    }

    /// Validate, and additionally require the filesystem to fit the device
    pub fn validate_for_device(&self, device_blocks: u64) -> Result<()> {
        self.validate()?;

        if self.block_count > device_blocks {
            return Err(BlobfsError::invalid(format!(
                "block count {} exceeds device size of {} blocks",
                self.block_count, device_blocks
            )));
        }

        Ok(())
    }

    /// Serialize to a full block
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BLOCK_SIZE);

        bytes.extend_from_slice(&self.magic0.to_le_bytes());
        bytes.extend_from_slice(&self.magic1.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.block_size.to_le_bytes());
        bytes.extend_from_slice(&self.block_count.to_le_bytes());
        bytes.extend_from_slice(&self.inode_count.to_le_bytes());
        bytes.extend_from_slice(&self.alloc_block_count.to_le_bytes());
        bytes.extend_from_slice(&self.alloc_inode_count.to_le_bytes());
        bytes.extend_from_slice(&self.chain_pointer.to_le_bytes());

        // Pad to BLOCK_SIZE
        bytes.resize(BLOCK_SIZE, 0);

        bytes
    }

    /// Deserialize and validate
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SUPERBLOCK_DISK_SIZE {
            return Err(BlobfsError::invalid(format!(
                "superblock needs {} bytes, got {}",
                SUPERBLOCK_DISK_SIZE,
                bytes.len()
            )));
        }

        let superblock = Superblock {
            magic0: le_u64(bytes, 0),
            magic1: le_u64(bytes, 8),
            version: le_u32(bytes, 16),
            block_size: le_u32(bytes, 20),
            block_count: le_u64(bytes, 24),
            inode_count: le_u64(bytes, 32),
            alloc_block_count: le_u64(bytes, 40),
            alloc_inode_count: le_u64(bytes, 48),
            chain_pointer: le_u64(bytes, 56),
        };

        superblock.validate()?;

        Ok(superblock)
    }
}

/// Read a little-endian u64; the caller guarantees `offset + 8 <= bytes.len()`
pub(crate) fn le_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}

pub(crate) fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}
