//! Offline blob injection
//!
//! Adds a host file to an unmounted image without going through the blob
//! lifecycle. The writes are independent and not atomic: a crash part way
//! leaves an image that the checker will flag.

use crate::allocator::block_map::BlockMap;
use crate::allocator::node_map::NodeMap;
use crate::error::{BlobfsError, Result};
use crate::header::{Superblock, BLOCK_SIZE, SUPERBLOCK_BLOCK};
use crate::inode::{self, Inode};
use crate::io::BlockDevice;
use crate::merkle;
use std::fs::File;
use std::path::Path;

/// Copy `source` into the image at `image` as a committed blob
///
/// Returns the inode written for it.
pub fn inject<P: AsRef<Path>, Q: AsRef<Path>>(image: P, source: Q) -> Result<Inode> {
    let file = File::open(source.as_ref())?;
    if file.metadata()?.len() == 0 {
        return Err(BlobfsError::invalid(format!(
            "{} is empty",
            source.as_ref().display()
        )));
    }

    // Safety: the source is opened read-only and only read through the map
    let content = unsafe { memmap2::Mmap::map(&file) }?;

    let (tree, digest) = merkle::build_tree(&content);
    let size = content.len() as u64;

    let mut device = BlockDevice::open(image.as_ref())?;
    let mut superblock = Superblock::from_bytes(&device.read_block(SUPERBLOCK_BLOCK)?)?;
    superblock.validate_for_device(device.block_count())?;

    let mut node_map = NodeMap::load(&mut device, &superblock)?;
    if node_map.find_committed(&digest).is_some() {
        return Err(BlobfsError::AlreadyExists(digest));
    }
    let index = node_map.allocate_slot()?;

    let mut block_map = BlockMap::load(&mut device, &superblock)?;
    let block_count = inode::blocks_for(size);
    let start_block = block_map.allocate_contiguous(block_count)?;

    let inode = Inode {
        digest,
        start_block,
        block_count,
        blob_size: size,
    };

    let tree_blocks = inode.tree_blocks();
    if tree_blocks > 0 {
        let mut padded = tree;
        padded.resize(tree_blocks as usize * BLOCK_SIZE, 0);
        device.write_blocks(start_block, &padded)?;
    }

    let full = content.len() / BLOCK_SIZE * BLOCK_SIZE;
    if full > 0 {
        device.write_blocks(inode.data_start_block(), &content[..full])?;
    }
    if full < content.len() {
        let mut last = vec![0u8; BLOCK_SIZE];
        last[..content.len() - full].copy_from_slice(&content[full..]);
        device.write_block(inode.data_start_block() + (full / BLOCK_SIZE) as u64, &last)?;
    }

    block_map.commit(start_block, block_count)?;
    node_map.commit(index, inode)?;
    superblock.alloc_block_count += block_count;
    superblock.alloc_inode_count += 1;

    block_map.persist_range(&mut device, start_block, block_count)?;
    node_map.persist(&mut device, index)?;
    device.write_block(SUPERBLOCK_BLOCK, &superblock.to_bytes())?;
    device.sync()?;

    tracing::info!(
        digest = %digest,
        size,
        start_block,
        block_count,
        "injected blob"
    );

    Ok(inode)
}
