//! Fixed-size inode records
//!
//! Layout (64 bytes, little-endian):
//!
//! ```text
//! 0..32   merkle root digest
//! 32..40  start block (0 = free, 1 = reserved, >= 2 = committed)
//! 40..48  block count (tree blocks + data blocks)
//! 48..56  blob size in bytes
//! 56..64  reserved, zero
//! ```

use crate::digest::{Digest, DIGEST_LEN};
use crate::header::{le_u64, BLOCK_SIZE};
use crate::merkle;
use serde::Serialize;

pub const INODE_SIZE: usize = 64;

pub const START_BLOCK_FREE: u64 = 0;
pub const START_BLOCK_RESERVED: u64 = 1;
pub const START_BLOCK_MINIMUM: u64 = 2;

/// Slot state derived from the `start_block` sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Reserved,
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Inode {
    pub digest: Digest,
    pub start_block: u64,
    pub block_count: u64,
    pub blob_size: u64,
}

impl Inode {
    pub fn state(&self) -> SlotState {
        match self.start_block {
            START_BLOCK_FREE => SlotState::Free,
            START_BLOCK_RESERVED => SlotState::Reserved,
            _ => SlotState::Committed,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.start_block >= START_BLOCK_MINIMUM
    }

    /// Exclusive end of the blob's extent; `None` if a corrupt record overflows
    pub fn end_block(&self) -> Option<u64> {
        self.start_block.checked_add(self.block_count)
    }

    /// Blocks holding the Merkle tree (they precede the data blocks)
    pub fn tree_blocks(&self) -> u64 {
        tree_blocks_for(self.blob_size)
    }

    /// First block holding content
    pub fn data_start_block(&self) -> u64 {
        self.start_block + self.tree_blocks()
    }

    pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut bytes = [0u8; INODE_SIZE];
        bytes[0..DIGEST_LEN].copy_from_slice(self.digest.as_bytes());
        bytes[32..40].copy_from_slice(&self.start_block.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.block_count.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.blob_size.to_le_bytes());
        bytes
    }

    /// Decode one record; the caller guarantees `bytes.len() >= INODE_SIZE`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[0..DIGEST_LEN]);

        Inode {
            digest: Digest::from_bytes(digest),
            start_block: le_u64(bytes, 32),
            block_count: le_u64(bytes, 40),
            blob_size: le_u64(bytes, 48),
        }
    }
}

/// Blocks needed for the Merkle tree of a blob of `blob_size` bytes
pub fn tree_blocks_for(blob_size: u64) -> u64 {
    merkle::tree_size(blob_size).div_ceil(BLOCK_SIZE as u64)
}

/// Blocks needed for the content of a blob of `blob_size` bytes
pub fn data_blocks_for(blob_size: u64) -> u64 {
    blob_size.div_ceil(BLOCK_SIZE as u64)
}

/// Total extent length of a blob: tree blocks followed by data blocks
pub fn blocks_for(blob_size: u64) -> u64 {
    tree_blocks_for(blob_size) + data_blocks_for(blob_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_listing_fields() {
        let inode = Inode {
            digest: Digest::from_bytes([1; 32]),
            start_block: 300,
            block_count: 3,
            blob_size: 9000,
        };
        let json = serde_json::to_value(inode).unwrap();
        assert_eq!(json["digest"], "01".repeat(32));
        assert_eq!(json["start_block"], 300);
        assert_eq!(json["blob_size"], 9000);
    }

    #[test]
    fn test_sentinels() {
        let mut inode = Inode::default();
        assert_eq!(inode.state(), SlotState::Free);

        inode.start_block = START_BLOCK_RESERVED;
        assert_eq!(inode.state(), SlotState::Reserved);
        assert!(!inode.is_committed());

        inode.start_block = 300;
        assert_eq!(inode.state(), SlotState::Committed);
        assert!(inode.is_committed());
    }

    #[test]
    fn test_inode_serialization() {
        let inode = Inode {
            digest: Digest::from_bytes([7u8; DIGEST_LEN]),
            start_block: 258,
            block_count: 3,
            blob_size: 20_000,
        };

        let bytes = inode.to_bytes();
        assert!(bytes[56..].iter().all(|&b| b == 0));
        assert_eq!(Inode::from_bytes(&bytes), inode);
    }

    #[test]
    fn test_block_count_formula() {
        // Single leaf: no tree blocks
        assert_eq!(blocks_for(5), 1);
        assert_eq!(blocks_for(BLOCK_SIZE as u64), 1);

        // Two leaves: one tree block plus two data blocks
        assert_eq!(tree_blocks_for(BLOCK_SIZE as u64 + 1), 1);
        assert_eq!(blocks_for(BLOCK_SIZE as u64 + 1), 3);
    }

    #[test]
    fn test_extent_helpers() {
        let inode = Inode {
            digest: Digest::ZERO,
            start_block: 300,
            block_count: 3,
            blob_size: BLOCK_SIZE as u64 + 1,
        };
        assert_eq!(inode.tree_blocks(), 1);
        assert_eq!(inode.data_start_block(), 301);
        assert_eq!(inode.end_block(), Some(303));
    }

    #[test]
    fn test_end_block_overflow() {
        let inode = Inode {
            start_block: u64::MAX,
            block_count: 2,
            ..Inode::default()
        };
        assert_eq!(inode.end_block(), None);
    }
}
