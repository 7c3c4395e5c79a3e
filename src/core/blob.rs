//! Blob lifecycle
//!
//! ```text
//!            reserve()           last byte written,
//!   Empty ─────────────▶ DataWrite ───────────────▶ Readable ──▶ Releasing
//!     │                     │        digest matches     │      (unlinked, last
//!     │                     │                           │       handle released)
//!     └─────────────────────┴──────────▶ Error ◀────────┘ (commit I/O failure)
//! ```
//!
//! A record owns the staging buffers for its tree and content. Entering
//! `Error` always hands the reserved inode slot and block extent back to the
//! allocators, so an errored record holds no on-disk resources.

use crate::blobstore::Volume;
use crate::digest::Digest;
use crate::error::{BlobfsError, Result};
use crate::header::BLOCK_SIZE;
use crate::inode::{self, Inode};
use crate::merkle;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlobState {
    /// Declared but no space reserved
    Empty,
    /// Space reserved, content arriving
    DataWrite,
    /// Committed and verified
    Readable,
    /// Unlinked and reclaimed
    Releasing,
    /// Integrity or I/O failure; resources already returned
    Error,
}

/// Capability flags, independent of the lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlobFlags {
    /// Flush the device before a commit is signalled
    pub sync: bool,
    /// Reclaim on last release
    pub deletable: bool,
    /// The root directory record
    pub directory: bool,
}

/// One-shot, level-triggered readiness event
///
/// Set exactly once, when the blob first becomes readable; never reset.
#[derive(Debug, Clone, Default)]
pub struct ReadySignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ReadySignal {
    fn set(&self) {
        let (lock, cvar) = &*self.inner;
        let mut ready = lock.lock();
        *ready = true;
        cvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until the signal is set
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut ready = lock.lock();
        while !*ready {
            cvar.wait(&mut ready);
        }
    }

    /// Block until set or `timeout` elapses; returns whether it was set
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.inner;
        let mut ready = lock.lock();
        while !*ready {
            if cvar.wait_until(&mut ready, deadline).timed_out() {
                break;
            }
        }
        *ready
    }
}

/// Point-in-time view of a record
#[derive(Debug, Clone, Serialize)]
pub struct BlobInfo {
    pub digest: Option<Digest>,
    pub state: BlobState,
    pub flags: BlobFlags,
    pub size: u64,
    pub block_count: u64,
    pub bytes_written: u64,
}

/// In-memory state of one blob
#[derive(Debug)]
pub struct BlobRecord {
    digest: Option<Digest>,
    state: BlobState,
    flags: BlobFlags,

    /// Inode slot while one is held
    node_index: Option<usize>,

    /// Extent and size; `start_block` is 0 until space is reserved
    inode: Inode,

    /// Whether the inode and bitmap have been committed
    committed: bool,

    bytes_written: u64,

    /// Leading data blocks already written to disk
    blocks_flushed: u64,

    tree: Vec<u8>,
    content: Vec<u8>,

    /// Whether `tree` and `content` hold the full blob
    loaded: bool,

    ready: ReadySignal,
}

impl BlobRecord {
    /// An undeclared record in `Empty`
    pub fn new() -> Self {
        BlobRecord {
            digest: None,
            state: BlobState::Empty,
            flags: BlobFlags::default(),
            node_index: None,
            inode: Inode::default(),
            committed: false,
            bytes_written: 0,
            blocks_flushed: 0,
            tree: Vec::new(),
            content: Vec::new(),
            loaded: false,
            ready: ReadySignal::default(),
        }
    }

    /// The root directory record, permanently `Empty`
    pub fn directory() -> Self {
        let mut record = Self::new();
        record.flags.directory = true;
        record
    }

    /// A readable record for a committed inode; content loads on first read
    pub fn from_inode(index: usize, inode: Inode) -> Self {
        let record = BlobRecord {
            digest: Some(inode.digest),
            state: BlobState::Readable,
            node_index: Some(index),
            inode,
            committed: true,
            bytes_written: inode.blob_size,
            blocks_flushed: inode::data_blocks_for(inode.blob_size),
            ..Self::new()
        };
        record.ready.set();
        record
    }

    pub fn digest(&self) -> Option<Digest> {
        self.digest
    }

    pub fn state(&self) -> BlobState {
        self.state
    }

    pub fn flags(&self) -> BlobFlags {
        self.flags
    }

    pub fn size(&self) -> u64 {
        self.inode.blob_size
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn info(&self) -> BlobInfo {
        BlobInfo {
            digest: self.digest,
            state: self.state,
            flags: self.flags,
            size: self.inode.blob_size,
            block_count: self.inode.block_count,
            bytes_written: self.bytes_written,
        }
    }

    pub fn set_sync(&mut self, sync: bool) {
        self.flags.sync = sync;
    }

    /// Name the blob before any content is known
    pub fn declare(&mut self, digest: Digest) -> Result<()> {
        if self.flags.directory {
            return Err(BlobfsError::bad_state("cannot name the root directory"));
        }
        if self.state != BlobState::Empty || self.digest.is_some() {
            return Err(BlobfsError::bad_state(format!(
                "declare requires an undeclared Empty blob, found {:?}",
                self.state
            )));
        }

        self.digest = Some(digest);
        Ok(())
    }

    /// Reserve an inode and `blocks_for(size)` contiguous blocks (`Empty → DataWrite`)
    pub fn reserve(&mut self, vol: &mut Volume, size: u64) -> Result<()> {
        let digest = match self.digest {
            Some(digest) if !self.flags.directory && self.state == BlobState::Empty => digest,
            _ => {
                return Err(BlobfsError::bad_state(format!(
                    "reserve requires a declared Empty blob, found {:?}",
                    self.state
                )))
            }
        };
        if size == 0 {
            return Err(BlobfsError::invalid("blob size must be nonzero"));
        }

        let content_len = usize::try_from(size).map_err(|_| BlobfsError::NoMemory)?;
        let tree_len = merkle::tree_size(size) as usize;
        let block_count = inode::blocks_for(size);

        let index = vol.node_map.allocate_slot()?;

        let start_block = match vol.block_map.allocate_contiguous(block_count) {
            Ok(start) => start,
            Err(err) => {
                vol.node_map.free_slot(index)?;
                return Err(err);
            }
        };

        let mut tree: Vec<u8> = Vec::new();
        let mut content: Vec<u8> = Vec::new();
        let staged = tree
            .try_reserve_exact(tree_len)
            .and_then(|_| content.try_reserve_exact(content_len));
        if let Err(err) = staged {
            vol.block_map.free(start_block, block_count)?;
            vol.node_map.free_slot(index)?;
            return Err(err.into());
        }

        self.tree = tree;
        self.content = content;
        self.node_index = Some(index);
        self.inode = Inode {
            digest,
            start_block,
            block_count,
            blob_size: size,
        };
        self.state = BlobState::DataWrite;

        tracing::debug!(
            inode = index,
            start_block,
            block_count,
            size,
            "reserved space for blob"
        );
        Ok(())
    }

    /// Append content, persisting each completed data block
    ///
    /// Returns the number of bytes consumed. The write that supplies the last
    /// byte verifies the content against the declared digest and commits it.
    pub fn write_bytes(&mut self, vol: &mut Volume, buf: &[u8]) -> Result<usize> {
        if self.state != BlobState::DataWrite {
            return Err(BlobfsError::bad_state(format!(
                "write requires DataWrite, found {:?}",
                self.state
            )));
        }

        let remaining = self.inode.blob_size - self.bytes_written;
        let to_write = (buf.len() as u64).min(remaining) as usize;
        self.content.extend_from_slice(&buf[..to_write]);
        self.bytes_written += to_write as u64;

        if self.bytes_written == self.inode.blob_size {
            // The final block is only written once the digest matches
            self.complete(vol)?;
        } else if let Err(err) = self.flush_data_blocks(vol) {
            return Err(self.fail(vol, err));
        }

        Ok(to_write)
    }

    /// Write every data block that is complete but not yet on disk
    fn flush_data_blocks(&mut self, vol: &mut Volume) -> Result<()> {
        let done = self.bytes_written == self.inode.blob_size;
        let full = self.bytes_written / BLOCK_SIZE as u64;

        if full > self.blocks_flushed {
            let from = (self.blocks_flushed * BLOCK_SIZE as u64) as usize;
            let to = (full * BLOCK_SIZE as u64) as usize;
            vol.device.write_blocks(
                self.inode.data_start_block() + self.blocks_flushed,
                &self.content[from..to],
            )?;
            self.blocks_flushed = full;
        }

        // Final partial block, zero padded
        if done && self.bytes_written % BLOCK_SIZE as u64 != 0 {
            let from = (self.blocks_flushed * BLOCK_SIZE as u64) as usize;
            let mut block = vec![0u8; BLOCK_SIZE];
            block[..self.content.len() - from].copy_from_slice(&self.content[from..]);
            vol.device
                .write_block(self.inode.data_start_block() + self.blocks_flushed, &block)?;
            self.blocks_flushed += 1;
        }

        Ok(())
    }

    /// Verify the complete content and commit it (`DataWrite → Readable`)
    fn complete(&mut self, vol: &mut Volume) -> Result<()> {
        let expected = self.inode.digest;
        let (tree, root) = merkle::build_tree(&self.content);

        if root != expected {
            tracing::warn!(
                expected = %expected,
                actual = %root,
                "blob content does not match its digest"
            );
            let err = BlobfsError::bad_state(format!(
                "digest mismatch: declared {}, content hashes to {}",
                expected, root
            ));
            return Err(self.fail(vol, err));
        }

        self.tree.clear();
        self.tree.extend_from_slice(&tree);

        if let Err(err) = self.persist_commit(vol) {
            return Err(self.fail(vol, err));
        }

        self.loaded = true;
        self.state = BlobState::Readable;
        self.ready.set();

        tracing::info!(
            digest = %expected,
            size = self.inode.blob_size,
            start_block = self.inode.start_block,
            "committed blob"
        );
        Ok(())
    }

    fn persist_commit(&mut self, vol: &mut Volume) -> Result<()> {
        self.flush_data_blocks(vol)?;

        let tree_blocks = self.inode.tree_blocks();
        if tree_blocks > 0 {
            let mut padded = self.tree.clone();
            padded.resize((tree_blocks as usize) * BLOCK_SIZE, 0);
            vol.device.write_blocks(self.inode.start_block, &padded)?;
        }

        let index = self
            .node_index
            .ok_or_else(|| BlobfsError::bad_state("commit without an inode slot"))?;

        vol.commit_blob(index, self.inode)?;
        self.committed = true;
        vol.persist_blob_metadata(index, &self.inode)?;

        if self.flags.sync {
            vol.device.sync()?;
        }

        Ok(())
    }

    /// Move to `Error`, returning held resources; passes `err` through
    fn fail(&mut self, vol: &mut Volume, err: BlobfsError) -> BlobfsError {
        self.state = BlobState::Error;
        self.content = Vec::new();
        self.tree = Vec::new();
        self.loaded = false;

        if let Err(reclaim_err) = self.reclaim(vol) {
            tracing::warn!("failed to reclaim errored blob: {}", reclaim_err);
        }

        err
    }

    /// Read `len` bytes at `offset`, verified against the digest
    ///
    /// The first read of a blob opened from disk loads its tree and content.
    /// Reads past the end are clamped.
    pub fn read(&mut self, vol: &mut Volume, offset: u64, len: u64) -> Result<Vec<u8>> {
        if self.state != BlobState::Readable {
            return Err(BlobfsError::bad_state(format!(
                "read requires Readable, found {:?}",
                self.state
            )));
        }

        let size = self.inode.blob_size;
        if offset > size {
            return Err(BlobfsError::invalid(format!(
                "offset {} beyond blob of {} bytes",
                offset, size
            )));
        }
        let len = len.min(size - offset);

        if !self.loaded {
            self.load(vol)?;
        }

        if let Err(err) = merkle::verify_range(
            &self.content,
            &self.tree,
            offset,
            len,
            &self.inode.digest,
        ) {
            tracing::warn!(
                digest = %self.inode.digest,
                offset,
                len,
                "read failed verification"
            );
            // Drop the cached copy so a later read goes back to disk
            self.tree = Vec::new();
            self.content = Vec::new();
            self.loaded = false;
            return Err(err);
        }

        Ok(self.content[offset as usize..(offset + len) as usize].to_vec())
    }

    fn load(&mut self, vol: &mut Volume) -> Result<()> {
        let tree_len = merkle::tree_size(self.inode.blob_size) as usize;
        let size = self.inode.blob_size as usize;
        let tree_bytes = self.inode.tree_blocks() as usize * BLOCK_SIZE;

        let blocks = vol
            .device
            .read_blocks(self.inode.start_block, self.inode.block_count)?;

        let content_end = tree_bytes.checked_add(size);
        if tree_len > tree_bytes || content_end.map_or(true, |end| end > blocks.len()) {
            return Err(BlobfsError::bad_state(format!(
                "extent of {} blocks cannot hold a {} byte blob",
                self.inode.block_count, self.inode.blob_size
            )));
        }

        let mut tree = Vec::new();
        tree.try_reserve_exact(tree_len)?;
        tree.extend_from_slice(&blocks[..tree_len]);

        let mut content = Vec::new();
        content.try_reserve_exact(size)?;
        content.extend_from_slice(&blocks[tree_bytes..tree_bytes + size]);

        self.tree = tree;
        self.content = content;
        self.loaded = true;

        tracing::debug!(digest = %self.inode.digest, "loaded blob from disk");
        Ok(())
    }

    /// Mark for reclamation on last release
    pub fn unlink(&mut self) -> Result<()> {
        if self.flags.directory {
            return Err(BlobfsError::bad_state("cannot unlink the root directory"));
        }
        if self.state == BlobState::Releasing {
            return Err(BlobfsError::bad_state("blob is already released"));
        }

        self.flags.deletable = true;
        Ok(())
    }

    pub fn ready_signal(&self) -> ReadySignal {
        self.ready.clone()
    }

    /// Whether releasing the last handle must free on-disk resources
    pub fn needs_reclaim(&self) -> bool {
        match self.state {
            BlobState::Empty | BlobState::Releasing => false,
            BlobState::Readable => self.flags.deletable,
            BlobState::DataWrite | BlobState::Error => self.node_index.is_some(),
        }
    }

    /// Return the inode slot and extent to the allocators and persist
    pub(crate) fn reclaim(&mut self, vol: &mut Volume) -> Result<()> {
        let Some(index) = self.node_index.take() else {
            return Ok(());
        };

        let start = self.inode.start_block;
        let count = self.inode.block_count;

        if self.committed {
            self.committed = false;
            vol.free_committed(index, start, count)?;
        } else {
            vol.free_reserved(index, start, count)?;
        }

        if self.state == BlobState::Readable {
            self.state = BlobState::Releasing;
        }

        tracing::debug!(inode = index, start, count, "reclaimed blob resources");
        Ok(())
    }
}

impl Default for BlobRecord {
    fn default() -> Self {
        Self::new()
    }
}
