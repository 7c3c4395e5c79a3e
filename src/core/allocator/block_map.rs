//! Block bitmap allocator
//!
//! One bit per device block, 0 = free and 1 = in use. The header region
//! (superblock, bitmap, inode table) is permanently set.
//!
//! Extents handed out by [`BlockMap::allocate_contiguous`] are held in a
//! reservation overlay until [`BlockMap::commit`] promotes them. Only
//! committed bits are ever written to disk, so the persisted bitmap matches the
//! committed inodes even while other blobs are mid-write.

use crate::allocator::find_contiguous;
use crate::error::{BlobfsError, Result};
use crate::header::{Superblock, BITMAP_START, BLOCK_SIZE};
use crate::io::BlockDevice;

const WORDS_PER_BLOCK: usize = BLOCK_SIZE / 8;

#[derive(Debug, Clone)]
pub struct BlockMap {
    /// Bits persisted on disk
    committed: Vec<u64>,

    /// Bits handed out but not yet committed
    reserved: Vec<u64>,

    /// Total number of blocks tracked
    total_blocks: u64,

    /// First block after the header region
    data_start: u64,
}

impl BlockMap {
    /// Create a map with only the header region in use
    pub fn new(total_blocks: u64, data_start: u64) -> Self {
        let num_words = total_blocks.div_ceil(64) as usize;
        let mut map = BlockMap {
            committed: vec![0u64; num_words],
            reserved: vec![0u64; num_words],
            total_blocks,
            data_start,
        };
        map.set_range(0, data_start.min(total_blocks));
        map
    }

    /// Decode the on-disk bitmap blocks
    pub fn from_bytes(bytes: &[u8], total_blocks: u64, data_start: u64) -> Result<Self> {
        let num_words = total_blocks.div_ceil(64) as usize;
        if bytes.len() < num_words * 8 {
            return Err(BlobfsError::invalid(format!(
                "bitmap of {} bytes cannot cover {} blocks",
                bytes.len(),
                total_blocks
            )));
        }

        let mut committed: Vec<u64> = bytes
            .chunks_exact(8)
            .take(num_words)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();

        // Ignore any stray bits past the end of the device
        let tail = total_blocks % 64;
        if tail != 0 {
            if let Some(last) = committed.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }

        Ok(BlockMap {
            committed,
            reserved: vec![0u64; num_words],
            total_blocks,
            data_start,
        })
    }

    /// Read the bitmap region described by `superblock`
    pub fn load(device: &mut BlockDevice, superblock: &Superblock) -> Result<Self> {
        let bytes = device.read_blocks(BITMAP_START, superblock.bitmap_blocks())?;
        Self::from_bytes(&bytes, superblock.block_count, superblock.data_start())
    }

    /// Bytes of bitmap block `index` (relative to the bitmap start)
    pub fn block_bytes(&self, index: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BLOCK_SIZE);
        let first = index as usize * WORDS_PER_BLOCK;

        for i in first..first + WORDS_PER_BLOCK {
            let word = self.committed.get(i).copied().unwrap_or(0);
            bytes.extend_from_slice(&word.to_le_bytes());
        }

        bytes
    }

    /// Bitmap blocks needed for this map
    pub fn bitmap_blocks(&self) -> u64 {
        self.total_blocks.div_ceil(BLOCK_SIZE as u64 * 8)
    }

    /// First-fit reservation of `n` contiguous blocks in the data region
    pub fn allocate_contiguous(&mut self, n: u64) -> Result<u64> {
        if n == 0 {
            return Err(BlobfsError::invalid("cannot allocate zero blocks"));
        }

        let committed = &self.committed;
        let reserved = &self.reserved;
        let start = find_contiguous(
            |i| committed[i] | reserved[i],
            self.data_start,
            self.total_blocks,
            n,
        )
        .ok_or(BlobfsError::NoSpace)?;

        for block in start..start + n {
            let (word, bit) = split(block);
            self.reserved[word] |= bit;
        }

        tracing::debug!(start, n, "reserved block extent");
        Ok(start)
    }

    /// Promote a reserved extent to committed
    pub fn commit(&mut self, start: u64, n: u64) -> Result<()> {
        self.check_data_range(start, n)?;

        for block in start..start + n {
            let (word, bit) = split(block);
            if self.reserved[word] & bit == 0 {
                return Err(BlobfsError::bad_state(format!(
                    "block {} committed without a reservation",
                    block
                )));
            }
        }

        for block in start..start + n {
            let (word, bit) = split(block);
            self.reserved[word] &= !bit;
            self.committed[word] |= bit;
        }

        Ok(())
    }

    /// Release an extent, whether reserved or committed
    pub fn free(&mut self, start: u64, n: u64) -> Result<()> {
        self.check_data_range(start, n)?;

        for block in start..start + n {
            let (word, bit) = split(block);
            if (self.committed[word] | self.reserved[word]) & bit == 0 {
                tracing::warn!("Double-free detected for block {}", block);
            }
            self.committed[word] &= !bit;
            self.reserved[word] &= !bit;
        }

        tracing::debug!(start, n, "freed block extent");
        Ok(())
    }

    /// Write the bitmap blocks covering `[start, start + n)`
    pub fn persist_range(&self, device: &mut BlockDevice, start: u64, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }

        let bits_per_block = BLOCK_SIZE as u64 * 8;
        let first = start / bits_per_block;
        let last = (start + n - 1) / bits_per_block;

        for index in first..=last {
            device.write_block(BITMAP_START + index, &self.block_bytes(index))?;
        }

        Ok(())
    }

    /// Whether `block` is committed on disk
    pub fn is_allocated(&self, block: u64) -> bool {
        if block >= self.total_blocks {
            return false;
        }
        let (word, bit) = split(block);
        self.committed[word] & bit != 0
    }

    /// Whether `block` is reserved by an in-flight write
    pub fn is_reserved(&self, block: u64) -> bool {
        if block >= self.total_blocks {
            return false;
        }
        let (word, bit) = split(block);
        self.reserved[word] & bit != 0
    }

    /// Count of committed bits, header region included
    pub fn count_set(&self) -> u64 {
        self.committed.iter().map(|w| w.count_ones() as u64).sum()
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    fn set_range(&mut self, start: u64, end: u64) {
        for block in start..end {
            let (word, bit) = split(block);
            self.committed[word] |= bit;
        }
    }

    fn check_data_range(&self, start: u64, n: u64) -> Result<()> {
        match start.checked_add(n) {
            Some(end) if start >= self.data_start && end <= self.total_blocks => Ok(()),
            _ => Err(BlobfsError::invalid(format!(
                "extent {}+{} outside data region {}..{}",
                start, n, self.data_start, self.total_blocks
            ))),
        }
    }
}

fn split(block: u64) -> (usize, u64) {
    ((block / 64) as usize, 1u64 << (block % 64))
}
