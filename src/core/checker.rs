//! Offline consistency checks (fsck)
//!
//! The checker only reports: it never modifies the image.

use crate::allocator::block_map::BlockMap;
use crate::allocator::node_map::NodeMap;
use crate::blobstore::Volume;
use crate::digest::Digest;
use crate::error::{BlobfsError, Result};
use crate::header::Superblock;
use crate::inode::{self, Inode};
use crate::io::BlockDevice;
use serde::Serialize;
use std::ops::Range;
use std::path::Path;

/// Outcome of a full check
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    /// Superblock as read from the image
    pub superblock: Superblock,
    pub block_count: u64,
    pub inode_count: u64,
    pub header_blocks: u64,
    pub alloc_block_count: u64,
    pub alloc_inode_count: u64,
    pub set_blocks: u64,
    pub committed_inodes: u64,
    pub errors: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct Checker {
    superblock: Superblock,
    block_map: BlockMap,
    node_map: NodeMap,
}

impl Checker {
    /// Load an image read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let volume = Volume::load(BlockDevice::open_read_only(path)?)?;
        Ok(Checker {
            superblock: volume.superblock,
            block_map: volume.block_map,
            node_map: volume.node_map,
        })
    }

    /// Snapshot the metadata of a mounted volume
    pub(crate) fn from_volume(volume: &Volume) -> Self {
        Checker {
            superblock: volume.superblock,
            block_map: volume.block_map.clone(),
            node_map: volume.node_map.clone(),
        }
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn count_committed_inodes(&self) -> u64 {
        self.node_map.count_committed()
    }

    /// Set bits in the bitmap, header region included
    pub fn count_set_blocks(&self) -> u64 {
        self.block_map.count_set()
    }

    /// Compare the bitmap and inode table against the superblock counters
    pub fn verify_counts(&self) -> Result<()> {
        let header_blocks = self.superblock.data_start();
        let set_blocks = self.count_set_blocks();
        let expected_blocks = header_blocks + self.superblock.alloc_block_count;

        if set_blocks != expected_blocks {
            return Err(BlobfsError::bad_state(format!(
                "bitmap has {} blocks set, expected {} header + {} allocated",
                set_blocks, header_blocks, self.superblock.alloc_block_count
            )));
        }

        let committed = self.count_committed_inodes();
        if committed != self.superblock.alloc_inode_count {
            return Err(BlobfsError::bad_state(format!(
                "inode table has {} committed inodes, superblock counts {}",
                committed, self.superblock.alloc_inode_count
            )));
        }

        Ok(())
    }

    /// Check every committed extent against the layout and the bitmap
    pub fn verify_extents(&self) -> Result<()> {
        let data_start = self.superblock.data_start();
        let block_count = self.superblock.block_count;

        let mut extents: Vec<(u64, u64, usize)> = Vec::new();
        for (index, inode) in self.node_map.committed() {
            let extent = committed_extent(index, inode, data_start, block_count)?;

            for block in extent.clone() {
                if !self.block_map.is_allocated(block) {
                    return Err(BlobfsError::bad_state(format!(
                        "inode {} owns block {} which is free in the bitmap",
                        index, block
                    )));
                }
            }

            extents.push((extent.start, extent.end, index));
        }

        extents.sort_unstable();
        for pair in extents.windows(2) {
            let (_, end, a) = pair[0];
            let (start, _, b) = pair[1];
            if start < end {
                return Err(BlobfsError::bad_state(format!(
                    "extents of inodes {} and {} overlap at block {}",
                    a, b, start
                )));
            }
        }

        Ok(())
    }

    /// Run all checks, collecting failures instead of stopping at the first
    pub fn check(&self) -> CheckReport {
        let mut errors = Vec::new();

        if let Err(e) = self.verify_counts() {
            errors.push(e.to_string());
        }
        if let Err(e) = self.verify_extents() {
            errors.push(e.to_string());
        }
        if let Some(digest) = self.duplicate_digest() {
            errors.push(format!("digest {} is committed more than once", digest));
        }

        for error in &errors {
            tracing::warn!("consistency check failed: {}", error);
        }

        CheckReport {
            superblock: self.superblock,
            block_count: self.superblock.block_count,
            inode_count: self.superblock.inode_count,
            header_blocks: self.superblock.data_start(),
            alloc_block_count: self.superblock.alloc_block_count,
            alloc_inode_count: self.superblock.alloc_inode_count,
            set_blocks: self.count_set_blocks(),
            committed_inodes: self.count_committed_inodes(),
            errors,
        }
    }

    fn duplicate_digest(&self) -> Option<Digest> {
        let mut digests: Vec<Digest> = self
            .node_map
            .committed()
            .map(|(_, inode)| inode.digest)
            .collect();
        digests.sort_unstable();
        digests
            .windows(2)
            .find(|pair| pair[0] == pair[1])
            .map(|pair| pair[0])
    }
}

/// Block range of a committed inode, checked against the data region
///
/// Rejects extents that overflow, leave `[data_start, block_count)`, or do not
/// have the length the blob size demands.
pub(crate) fn committed_extent(
    index: usize,
    inode: &Inode,
    data_start: u64,
    block_count: u64,
) -> Result<Range<u64>> {
    let end = inode
        .end_block()
        .filter(|&end| inode.start_block >= data_start && end <= block_count)
        .ok_or_else(|| {
            BlobfsError::bad_state(format!(
                "inode {} extent {}+{} outside data region {}..{}",
                index, inode.start_block, inode.block_count, data_start, block_count
            ))
        })?;

    let expected = inode::blocks_for(inode.blob_size);
    if inode.blob_size == 0 || inode.block_count != expected {
        return Err(BlobfsError::bad_state(format!(
            "inode {} has {} blocks for {} bytes, expected {}",
            index, inode.block_count, inode.blob_size, expected
        )));
    }

    Ok(inode.start_block..end)
}
