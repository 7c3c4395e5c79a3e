//! Inode slot allocator
//!
//! Mirrors the on-disk inode table in memory. A slot is free while its
//! `start_block` is 0; allocation flips it to the reserved sentinel before
//! returning so a second allocation cannot hand out the same slot.

use crate::digest::Digest;
use crate::error::{BlobfsError, Result};
use crate::header::{Superblock, INODES_PER_BLOCK};
use crate::inode::{Inode, SlotState, INODE_SIZE, START_BLOCK_RESERVED};
use crate::io::BlockDevice;

#[derive(Debug, Clone)]
pub struct NodeMap {
    inodes: Vec<Inode>,

    /// First block of the inode table
    table_start: u64,
}

impl NodeMap {
    /// An empty table of `capacity` slots
    pub fn new(capacity: usize, table_start: u64) -> Self {
        NodeMap {
            inodes: vec![Inode::default(); capacity],
            table_start,
        }
    }

    /// Decode inode table blocks
    pub fn from_bytes(bytes: &[u8], capacity: usize, table_start: u64) -> Result<Self> {
        if bytes.len() < capacity * INODE_SIZE {
            return Err(BlobfsError::invalid(format!(
                "inode table of {} bytes cannot hold {} inodes",
                bytes.len(),
                capacity
            )));
        }

        let inodes = bytes
            .chunks_exact(INODE_SIZE)
            .take(capacity)
            .map(Inode::from_bytes)
            .collect();

        Ok(NodeMap {
            inodes,
            table_start,
        })
    }

    /// Read the inode table described by `superblock`
    pub fn load(device: &mut BlockDevice, superblock: &Superblock) -> Result<Self> {
        let bytes = device.read_blocks(
            superblock.inode_table_start(),
            superblock.inode_table_blocks(),
        )?;
        Self::from_bytes(
            &bytes,
            superblock.inode_count as usize,
            superblock.inode_table_start(),
        )
    }

    /// Reserve the first free slot
    pub fn allocate_slot(&mut self) -> Result<usize> {
        let index = self
            .inodes
            .iter()
            .position(|inode| inode.state() == SlotState::Free)
            .ok_or(BlobfsError::NoResources)?;

        self.inodes[index].start_block = START_BLOCK_RESERVED;
        Ok(index)
    }

    /// Zero a slot, digest and sentinel included
    pub fn free_slot(&mut self, index: usize) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.state() == SlotState::Free {
            tracing::warn!("Double-free detected for inode {}", index);
        }
        *slot = Inode::default();
        Ok(())
    }

    /// Record a committed inode in a reserved slot
    pub fn commit(&mut self, index: usize, inode: Inode) -> Result<()> {
        if !inode.is_committed() {
            return Err(BlobfsError::invalid(format!(
                "inode start block {} is a sentinel",
                inode.start_block
            )));
        }

        let slot = self.slot_mut(index)?;
        if slot.state() != SlotState::Reserved {
            return Err(BlobfsError::bad_state(format!(
                "inode {} committed while {:?}",
                index,
                slot.state()
            )));
        }

        *slot = inode;
        Ok(())
    }

    /// Write the inode table block holding slot `index`
    ///
    /// Reserved slots are written as free: the sentinel only lives in memory.
    pub fn persist(&self, device: &mut BlockDevice, index: usize) -> Result<()> {
        if index >= self.inodes.len() {
            return Err(BlobfsError::invalid(format!("inode {} out of range", index)));
        }

        let per_block = INODES_PER_BLOCK as usize;
        let block_index = index / per_block;
        let first = block_index * per_block;

        let mut bytes = Vec::with_capacity(per_block * INODE_SIZE);
        for inode in &self.inodes[first..first + per_block] {
            let on_disk = if inode.state() == SlotState::Reserved {
                Inode::default()
            } else {
                *inode
            };
            bytes.extend_from_slice(&on_disk.to_bytes());
        }

        device.write_block(self.table_start + block_index as u64, &bytes)
    }

    pub fn get(&self, index: usize) -> Option<&Inode> {
        self.inodes.get(index)
    }

    /// Linear scan for a committed inode with `digest`
    pub fn find_committed(&self, digest: &Digest) -> Option<(usize, Inode)> {
        self.committed()
            .find(|(_, inode)| inode.digest == *digest)
            .map(|(index, inode)| (index, *inode))
    }

    /// All committed inodes with their slot index
    pub fn committed(&self) -> impl Iterator<Item = (usize, &Inode)> {
        self.inodes
            .iter()
            .enumerate()
            .filter(|(_, inode)| inode.is_committed())
    }

    pub fn count_committed(&self) -> u64 {
        self.committed().count() as u64
    }

    pub fn capacity(&self) -> usize {
        self.inodes.len()
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Inode> {
        self.inodes
            .get_mut(index)
            .ok_or_else(|| BlobfsError::invalid(format!("inode {} out of range", index)))
    }
}
