//! Image creation (mkfs)

use crate::allocator::block_map::BlockMap;
use crate::config::FormatOptions;
use crate::error::{BlobfsError, Result};
use crate::header::{Superblock, INODES_PER_BLOCK, SUPERBLOCK_BLOCK};
use crate::io::BlockDevice;
use std::path::Path;

/// Write an empty filesystem of `block_count` blocks to `path`
///
/// The image file is created or truncated. Counters start at zero, the
/// header region is marked in the bitmap, and the inode table is all free.
pub fn format<P: AsRef<Path>>(
    path: P,
    block_count: u64,
    options: &FormatOptions,
) -> Result<Superblock> {
    if options.inode_count == 0 || options.inode_count % INODES_PER_BLOCK != 0 {
        return Err(BlobfsError::invalid(format!(
            "inode count {} must be a nonzero multiple of {}",
            options.inode_count, INODES_PER_BLOCK
        )));
    }

    let superblock = Superblock::new(block_count, options.inode_count);
    superblock.validate()?;

    let mut device = BlockDevice::create(path.as_ref(), block_count)?;

    let bitmap = BlockMap::new(block_count, superblock.data_start());
    bitmap.persist_range(&mut device, 0, block_count)?;

    // Truncation already zeroed the inode table and data region
    device.write_block(SUPERBLOCK_BLOCK, &superblock.to_bytes())?;
    device.sync()?;

    tracing::info!(
        path = %path.as_ref().display(),
        block_count,
        inode_count = options.inode_count,
        data_start = superblock.data_start(),
        "formatted blobfs image"
    );

    Ok(superblock)
}
