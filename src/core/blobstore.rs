//! Mounted blobstore
//!
//! [`Volume`] holds the device and the in-memory copies of the superblock,
//! bitmap and inode table. [`Blobstore`] owns every open [`BlobRecord`] in an
//! arena indexed by digest and hands out [`BlobHandle`]s. Handles are counted
//! by the engine: each one must be given back through
//! [`Blobstore::release`], and the last release decides whether the blob's
//! on-disk resources are reclaimed.
//!
//! Every method takes `&mut self`; share a mounted store behind a mutex.

use crate::allocator::block_map::BlockMap;
use crate::allocator::node_map::NodeMap;
use crate::blob::{BlobInfo, BlobRecord, BlobState, ReadySignal};
use crate::checker::{self, CheckReport, Checker};
use crate::config::MountOptions;
use crate::digest::Digest;
use crate::error::{BlobfsError, Result};
use crate::header::{Superblock, SUPERBLOCK_BLOCK};
use crate::inode::Inode;
use crate::io::BlockDevice;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Device plus in-memory filesystem metadata
pub struct Volume {
    pub(crate) device: BlockDevice,
    pub(crate) superblock: Superblock,
    pub(crate) block_map: BlockMap,
    pub(crate) node_map: NodeMap,
}

impl Volume {
    /// Open an image read-write with a block cache of `cache_blocks`
    pub fn open<P: AsRef<Path>>(path: P, cache_blocks: usize) -> Result<Self> {
        let device = BlockDevice::open(path)?.with_cache(cache_blocks);
        Self::load(device)
    }

    /// Read and validate the superblock, then load both allocators
    pub fn load(mut device: BlockDevice) -> Result<Self> {
        let superblock = Superblock::from_bytes(&device.read_block(SUPERBLOCK_BLOCK)?)?;
        superblock.validate_for_device(device.block_count())?;

        let block_map = BlockMap::load(&mut device, &superblock)?;
        let node_map = NodeMap::load(&mut device, &superblock)?;

        Ok(Volume {
            device,
            superblock,
            block_map,
            node_map,
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn block_map(&self) -> &BlockMap {
        &self.block_map
    }

    pub fn node_map(&self) -> &NodeMap {
        &self.node_map
    }

    /// Commit a blob's extent and inode in memory and bump the counters
    pub(crate) fn commit_blob(&mut self, index: usize, inode: Inode) -> Result<()> {
        self.block_map.commit(inode.start_block, inode.block_count)?;
        self.node_map.commit(index, inode)?;
        self.superblock.alloc_block_count += inode.block_count;
        self.superblock.alloc_inode_count += 1;
        Ok(())
    }

    /// Write the bitmap range, inode block and superblock for a blob
    pub(crate) fn persist_blob_metadata(&mut self, index: usize, inode: &Inode) -> Result<()> {
        self.block_map
            .persist_range(&mut self.device, inode.start_block, inode.block_count)?;
        self.node_map.persist(&mut self.device, index)?;
        self.persist_superblock()
    }

    /// Return an uncommitted reservation
    pub(crate) fn free_reserved(&mut self, index: usize, start: u64, count: u64) -> Result<()> {
        self.node_map.free_slot(index)?;
        self.block_map.free(start, count)?;
        self.block_map.persist_range(&mut self.device, start, count)?;
        self.node_map.persist(&mut self.device, index)
    }

    /// Return a committed blob's resources and lower the counters
    pub(crate) fn free_committed(&mut self, index: usize, start: u64, count: u64) -> Result<()> {
        self.node_map.free_slot(index)?;
        self.block_map.free(start, count)?;
        self.superblock.alloc_block_count = self.superblock.alloc_block_count.saturating_sub(count);
        self.superblock.alloc_inode_count = self.superblock.alloc_inode_count.saturating_sub(1);

        self.block_map.persist_range(&mut self.device, start, count)?;
        self.node_map.persist(&mut self.device, index)?;
        self.persist_superblock()
    }

    fn persist_superblock(&mut self) -> Result<()> {
        self.device
            .write_block(SUPERBLOCK_BLOCK, &self.superblock.to_bytes())
    }
}

/// Counted reference to an open blob
///
/// Not `Clone`: use [`Blobstore::clone_handle`] so the engine sees every copy.
#[derive(Debug, PartialEq, Eq)]
pub struct BlobHandle {
    id: usize,
}

impl BlobHandle {
    /// Arena slot; two handles to the same open blob share it
    pub fn id(&self) -> usize {
        self.id
    }
}

/// Space accounting for a mounted store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub block_count: u64,
    pub data_blocks: u64,
    pub alloc_block_count: u64,
    pub free_data_blocks: u64,
    pub inode_count: u64,
    pub alloc_inode_count: u64,
}

struct Entry {
    record: BlobRecord,
    handles: usize,
}

pub struct Blobstore {
    volume: Volume,

    /// Open records; `None` slots are recycled through `free_ids`
    records: Vec<Option<Entry>>,
    free_ids: Vec<usize>,

    /// Digest to arena slot, for every open named record
    index: HashMap<Digest, usize>,

    /// Arena slot of the root directory
    root: usize,

    options: MountOptions,
}

impl Blobstore {
    /// Mount the image at `path`
    pub fn mount<P: AsRef<Path>>(path: P, options: MountOptions) -> Result<Self> {
        let volume = Volume::open(path.as_ref(), options.cache_blocks)?;

        tracing::info!(
            path = %path.as_ref().display(),
            blocks = volume.superblock.block_count,
            blobs = volume.superblock.alloc_inode_count,
            "mounted blobfs image"
        );

        Ok(Blobstore {
            volume,
            records: vec![Some(Entry {
                record: BlobRecord::directory(),
                handles: 0,
            })],
            free_ids: Vec::new(),
            index: HashMap::new(),
            root: 0,
            options,
        })
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn superblock(&self) -> &Superblock {
        &self.volume.superblock
    }

    /// Handle to the root directory
    pub fn root(&mut self) -> BlobHandle {
        let id = self.root;
        if let Some(entry) = self.records[id].as_mut() {
            entry.handles += 1;
        }
        BlobHandle { id }
    }

    /// Find a blob by digest
    ///
    /// Open records are found through the index. Otherwise the inode table is
    /// scanned and a readable record is materialized for the committed inode;
    /// its content is read from disk on first use. Unlinked blobs are not found.
    /// An inode whose extent does not fit its size or the data region is
    /// rejected with `BadState`.
    pub fn lookup(&mut self, digest: &Digest) -> Result<BlobHandle> {
        if let Some(&id) = self.index.get(digest) {
            let entry = self.entry_mut(id)?;
            if entry.record.flags().deletable {
                return Err(BlobfsError::NotFound(*digest));
            }
            entry.handles += 1;
            return Ok(BlobHandle { id });
        }

        let (index, inode) = self
            .volume
            .node_map
            .find_committed(digest)
            .ok_or(BlobfsError::NotFound(*digest))?;

        let sb = &self.volume.superblock;
        if let Err(err) = checker::committed_extent(index, &inode, sb.data_start(), sb.block_count)
        {
            tracing::warn!(digest = %digest, inode = index, "refusing corrupt inode: {}", err);
            return Err(err);
        }

        tracing::debug!(digest = %digest, inode = index, "materialized blob from inode table");
        Ok(self.insert(*digest, BlobRecord::from_inode(index, inode)))
    }

    /// Look up a blob that is ready to read
    pub fn open(&mut self, digest: &Digest) -> Result<BlobHandle> {
        let handle = self.lookup(digest)?;
        let state = self.entry(&handle)?.record.state();
        if state != BlobState::Readable {
            self.release(handle)?;
            return Err(BlobfsError::bad_state(format!(
                "blob {} is {:?}, not readable",
                digest, state
            )));
        }
        Ok(handle)
    }

    /// Start a new blob named by `digest`
    pub fn create(&mut self, digest: &Digest) -> Result<BlobHandle> {
        if self.index.contains_key(digest) || self.volume.node_map.find_committed(digest).is_some() {
            return Err(BlobfsError::AlreadyExists(*digest));
        }

        let mut record = BlobRecord::new();
        record.declare(*digest)?;
        record.set_sync(self.options.sync_commits);

        tracing::debug!(digest = %digest, "created blob");
        Ok(self.insert(*digest, record))
    }

    /// Another counted handle to the same blob
    pub fn clone_handle(&mut self, handle: &BlobHandle) -> Result<BlobHandle> {
        let entry = self.entry_mut(handle.id)?;
        entry.handles += 1;
        Ok(BlobHandle { id: handle.id })
    }

    /// Give back a handle; the last release of a blob closes it
    ///
    /// Unlinked readable blobs, errored blobs and abandoned writes have their
    /// inode and blocks freed. Readable blobs keep their data on disk.
    pub fn release(&mut self, handle: BlobHandle) -> Result<()> {
        let id = handle.id;
        let entry = self.entry_mut(id)?;
        entry.handles = entry.handles.saturating_sub(1);

        if entry.handles > 0 || id == self.root {
            return Ok(());
        }

        let Some(mut entry) = self.records[id].take() else {
            return Ok(());
        };
        self.free_ids.push(id);

        if let Some(digest) = entry.record.digest() {
            if self.index.get(&digest) == Some(&id) {
                self.index.remove(&digest);
            }
        }

        if entry.record.needs_reclaim() {
            if entry.record.state() == BlobState::DataWrite {
                tracing::debug!(
                    written = entry.record.bytes_written(),
                    size = entry.record.size(),
                    "abandoned partial write"
                );
            }
            entry.record.reclaim(&mut self.volume)?;
        }

        Ok(())
    }

    /// Reserve space for `size` bytes of content
    pub fn reserve(&mut self, handle: &BlobHandle, size: u64) -> Result<()> {
        let entry = Self::slot(&mut self.records, handle.id)?;
        entry.record.reserve(&mut self.volume, size)
    }

    /// Append content; returns how many bytes were taken
    pub fn write(&mut self, handle: &BlobHandle, buf: &[u8]) -> Result<usize> {
        let entry = Self::slot(&mut self.records, handle.id)?;
        entry.record.write_bytes(&mut self.volume, buf)
    }

    /// Verified read of up to `len` bytes at `offset`
    pub fn read(&mut self, handle: &BlobHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        let entry = Self::slot(&mut self.records, handle.id)?;
        entry.record.read(&mut self.volume, offset, len)
    }

    /// Mark a blob for deletion once its last handle is released
    pub fn unlink(&mut self, handle: &BlobHandle) -> Result<()> {
        let entry = self.entry_mut(handle.id)?;
        entry.record.unlink()?;
        tracing::debug!(digest = ?entry.record.digest(), "unlinked blob");
        Ok(())
    }

    pub fn set_sync(&mut self, handle: &BlobHandle, sync: bool) -> Result<()> {
        self.entry_mut(handle.id)?.record.set_sync(sync);
        Ok(())
    }

    /// Readiness signal for waiting from another thread
    pub fn ready_signal(&self, handle: &BlobHandle) -> Result<ReadySignal> {
        Ok(self.entry(handle)?.record.ready_signal())
    }

    /// Wait up to `timeout` for the blob to become readable
    pub fn wait_until_readable(&self, handle: &BlobHandle, timeout: Duration) -> Result<()> {
        if self.ready_signal(handle)?.wait_timeout(timeout) {
            Ok(())
        } else {
            Err(BlobfsError::bad_state("timed out waiting for blob to become readable"))
        }
    }

    pub fn stat(&self, handle: &BlobHandle) -> Result<BlobInfo> {
        Ok(self.entry(handle)?.record.info())
    }

    /// Digests of every committed blob, in inode table order
    pub fn list_blobs(&self) -> Vec<Digest> {
        self.volume
            .node_map
            .committed()
            .map(|(_, inode)| inode.digest)
            .collect()
    }

    pub fn usage(&self) -> Usage {
        let sb = &self.volume.superblock;
        Usage {
            block_count: sb.block_count,
            data_blocks: sb.data_blocks(),
            alloc_block_count: sb.alloc_block_count,
            free_data_blocks: sb.free_data_blocks(),
            inode_count: sb.inode_count,
            alloc_inode_count: sb.alloc_inode_count,
        }
    }

    /// Run the consistency checks against the in-memory metadata
    pub fn check(&self) -> CheckReport {
        Checker::from_volume(&self.volume).check()
    }

    /// Flush the device
    pub fn sync(&mut self) -> Result<()> {
        self.volume.device.sync()
    }

    fn insert(&mut self, digest: Digest, record: BlobRecord) -> BlobHandle {
        let entry = Entry { record, handles: 1 };
        let id = match self.free_ids.pop() {
            Some(id) => {
                self.records[id] = Some(entry);
                id
            }
            None => {
                self.records.push(Some(entry));
                self.records.len() - 1
            }
        };
        self.index.insert(digest, id);
        BlobHandle { id }
    }

    fn entry(&self, handle: &BlobHandle) -> Result<&Entry> {
        self.records
            .get(handle.id)
            .and_then(Option::as_ref)
            .ok_or_else(|| BlobfsError::bad_state(format!("stale blob handle {}", handle.id)))
    }

    fn entry_mut(&mut self, id: usize) -> Result<&mut Entry> {
        Self::slot(&mut self.records, id)
    }

    // Borrows only the arena so callers can pass `&mut self.volume` alongside
    fn slot(records: &mut [Option<Entry>], id: usize) -> Result<&mut Entry> {
        records
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or_else(|| BlobfsError::bad_state(format!("stale blob handle {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatOptions;
    use crate::format::format;
    use crate::merkle::root_digest;
    use tempfile::NamedTempFile;

    fn mounted(blocks: u64) -> (NamedTempFile, Blobstore) {
        let temp = NamedTempFile::new().unwrap();
        format(temp.path(), blocks, &FormatOptions { inode_count: 128 }).unwrap();
        let store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();
        (temp, store)
    }

    fn put(store: &mut Blobstore, content: &[u8]) -> BlobHandle {
        let handle = store.create(&root_digest(content)).unwrap();
        store.reserve(&handle, content.len() as u64).unwrap();
        store.write(&handle, content).unwrap();
        handle
    }

    #[test]
    fn test_create_write_read() {
        let (_temp, mut store) = mounted(64);
        let handle = put(&mut store, b"some content");

        assert_eq!(store.read(&handle, 5, 7).unwrap(), b"content");
        assert!(store.ready_signal(&handle).unwrap().is_set());
        assert_eq!(store.usage().alloc_inode_count, 1);
        store.release(handle).unwrap();

        // Data survives release
        assert_eq!(store.list_blobs(), vec![root_digest(b"some content")]);
    }

    #[test]
    fn test_lookup_shares_record() {
        let (_temp, mut store) = mounted(64);
        let digest = root_digest(b"shared");
        let created = put(&mut store, b"shared");

        let a = store.lookup(&digest).unwrap();
        let b = store.lookup(&digest).unwrap();
        assert_eq!(a.id(), created.id());
        assert_eq!(a.id(), b.id());

        store.release(created).unwrap();
        store.release(a).unwrap();
        store.release(b).unwrap();

        // Rematerialized from the inode table after the last release
        let again = store.open(&digest).unwrap();
        assert_eq!(store.read(&again, 0, 6).unwrap(), b"shared");
    }

    #[test]
    fn test_duplicate_create() {
        let (_temp, mut store) = mounted(64);
        let digest = root_digest(b"dup");

        let pending = store.create(&digest).unwrap();
        assert!(matches!(
            store.create(&digest),
            Err(BlobfsError::AlreadyExists(_))
        ));
        store.release(pending).unwrap();

        let handle = put(&mut store, b"dup");
        store.release(handle).unwrap();
        assert!(matches!(
            store.create(&digest),
            Err(BlobfsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_lookup_missing() {
        let (_temp, mut store) = mounted(64);
        assert!(matches!(
            store.lookup(&root_digest(b"nothing")),
            Err(BlobfsError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_requires_readable() {
        let (_temp, mut store) = mounted(64);
        let digest = root_digest(b"pending");
        let handle = store.create(&digest).unwrap();

        assert!(matches!(store.open(&digest), Err(BlobfsError::BadState(_))));
        assert!(matches!(
            store.wait_until_readable(&handle, Duration::from_millis(1)),
            Err(BlobfsError::BadState(_))
        ));
        store.release(handle).unwrap();
    }

    #[test]
    fn test_unlink_reclaims_on_last_release() {
        let (_temp, mut store) = mounted(64);
        let digest = root_digest(b"short lived");
        let handle = put(&mut store, b"short lived");
        let other = store.clone_handle(&handle).unwrap();

        store.unlink(&handle).unwrap();
        store.release(handle).unwrap();
        assert_eq!(store.usage().alloc_inode_count, 1);
        assert!(matches!(store.lookup(&digest), Err(BlobfsError::NotFound(_))));

        store.release(other).unwrap();
        assert_eq!(store.usage().alloc_inode_count, 0);
        assert_eq!(store.usage().alloc_block_count, 0);
        assert!(store.list_blobs().is_empty());
        assert!(store.check().is_clean());
    }

    #[test]
    fn test_abandoned_write_reclaimed() {
        let (_temp, mut store) = mounted(64);
        let free_before = store.usage().free_data_blocks;

        let content = vec![1u8; 20000];
        let handle = store.create(&root_digest(&content)).unwrap();
        store.reserve(&handle, content.len() as u64).unwrap();
        store.write(&handle, &content[..9000]).unwrap();
        store.release(handle).unwrap();

        assert_eq!(store.usage().free_data_blocks, free_before);
        assert!(!store.volume().block_map().is_reserved(store.superblock().data_start()));

        // Space can be handed out again
        let again = put(&mut store, &content);
        assert_eq!(store.stat(&again).unwrap().state, BlobState::Readable);
    }

    #[test]
    fn test_root_directory() {
        let (_temp, mut store) = mounted(64);
        let root = store.root();
        let info = store.stat(&root).unwrap();
        assert!(info.flags.directory);
        assert_eq!(info.state, BlobState::Empty);
        assert!(store.unlink(&root).is_err());
        store.release(root).unwrap();

        // Root outlives its handles
        let root = store.root();
        assert!(store.stat(&root).unwrap().flags.directory);
    }

    #[test]
    fn test_stat_reports_progress() {
        let (_temp, mut store) = mounted(64);
        let content = b"progressive".to_vec();
        let handle = store.create(&root_digest(&content)).unwrap();
        store.reserve(&handle, content.len() as u64).unwrap();
        store.write(&handle, &content[..4]).unwrap();

        let info = store.stat(&handle).unwrap();
        assert_eq!(info.state, BlobState::DataWrite);
        assert_eq!(info.bytes_written, 4);
        assert_eq!(info.size, content.len() as u64);
        assert_eq!(info.block_count, 1);
    }
}
