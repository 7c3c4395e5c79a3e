//! Block device access for blobfs images

use crate::error::{BlobfsError, Result};
use crate::header::BLOCK_SIZE;
use lru::LruCache;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// File-backed block device
///
/// Addresses the image in `BLOCK_SIZE` blocks. An optional write-through LRU
/// cache keyed by block number serves repeated metadata reads; it belongs to
/// one device instance and is updated on every write, so it never serves
/// data older than the last write through this device.
pub struct BlockDevice {
    file: File,
    path: PathBuf,
    block_count: u64,
    cache: Option<LruCache<u64, Vec<u8>>>,
}

impl BlockDevice {
    /// Create (or truncate) an image of `block_count` zeroed blocks
    pub fn create<P: AsRef<Path>>(path: P, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.set_len(block_count * BLOCK_SIZE as u64)?;

        Ok(BlockDevice {
            file,
            path: path.as_ref().to_path_buf(),
            block_count,
            cache: None,
        })
    }

    /// Open an existing image for reading and writing
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::from_file(file, path.as_ref())
    }

    /// Open an existing image without write access
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;
        Self::from_file(file, path.as_ref())
    }

    fn from_file(file: File, path: &Path) -> Result<Self> {
        let block_count = file.metadata()?.len() / BLOCK_SIZE as u64;

        Ok(BlockDevice {
            file,
            path: path.to_path_buf(),
            block_count,
            cache: None,
        })
    }

    /// Enable the block cache with room for `capacity` blocks (0 disables it)
    pub fn with_cache(mut self, capacity: usize) -> Self {
        self.cache = NonZeroUsize::new(capacity).map(LruCache::new);
        self
    }

    /// Size of the device in blocks
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, start: u64, count: u64) -> Result<()> {
        match start.checked_add(count) {
            Some(end) if end <= self.block_count => Ok(()),
            _ => Err(BlobfsError::invalid(format!(
                "blocks {}+{} beyond device of {} blocks",
                start, count, self.block_count
            ))),
        }
    }

    /// Read one block
    pub fn read_block(&mut self, block: u64) -> Result<Vec<u8>> {
        self.check_range(block, 1)?;

        if let Some(data) = self.cache.as_mut().and_then(|cache| cache.get(&block)) {
            return Ok(data.clone());
        }

        self.file.seek(SeekFrom::Start(block * BLOCK_SIZE as u64))?;
        let mut buffer = vec![0u8; BLOCK_SIZE];
        self.file.read_exact(&mut buffer)?;

        if let Some(cache) = self.cache.as_mut() {
            cache.put(block, buffer.clone());
        }

        Ok(buffer)
    }

    /// Read `count` contiguous blocks, bypassing the cache
    pub fn read_blocks(&mut self, start: u64, count: u64) -> Result<Vec<u8>> {
        self.check_range(start, count)?;

        let len = (count as usize)
            .checked_mul(BLOCK_SIZE)
            .ok_or_else(|| BlobfsError::invalid("read length overflows"))?;
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(len)?;
        buffer.resize(len, 0);

        self.file.seek(SeekFrom::Start(start * BLOCK_SIZE as u64))?;
        self.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Write one full block
    pub fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(BlobfsError::invalid(format!(
                "block data must be exactly {} bytes, got {}",
                BLOCK_SIZE,
                data.len()
            )));
        }

        self.write_blocks(block, data)
    }

    /// Write whole blocks starting at `start`
    pub fn write_blocks(&mut self, start: u64, data: &[u8]) -> Result<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(BlobfsError::invalid(format!(
                "write of {} bytes is not block aligned",
                data.len()
            )));
        }

        let count = (data.len() / BLOCK_SIZE) as u64;
        self.check_range(start, count)?;

        tracing::trace!(start, count, "writing blocks");

        self.file.seek(SeekFrom::Start(start * BLOCK_SIZE as u64))?;
        self.file.write_all(data)?;

        if let Some(cache) = self.cache.as_mut() {
            for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
                let block = start + i as u64;
                if let Some(cached) = cache.get_mut(&block) {
                    cached.copy_from_slice(chunk);
                }
            }
        }

        Ok(())
    }

    /// Flush all writes to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
