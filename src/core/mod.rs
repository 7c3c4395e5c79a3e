//! Blobfs storage layer
//!
//! ## On-disk format
//!
//! - [`header`] - Superblock (block 0), magic numbers and geometry
//! - [`inode`] - 64-byte inode records and extent sizing
//! - [`digest`] - SHA-256 content names
//! - [`merkle`] - Merkle tree construction and range verification
//!
//! ## Allocation and I/O
//!
//! - [`io`] - File-backed block device with an LRU block cache
//! - [`allocator`] - Block bitmap and inode slot allocators:
//!   - [`allocator::block_map`] - First-fit contiguous extents
//!   - [`allocator::node_map`] - Inode table slots
//!
//! ## Engine
//!
//! - [`blob`] - Per-blob state machine
//! - [`blobstore`] - Mounted store: lookup, create, release
//!
//! ## Offline tools
//!
//! - [`format`] - Create an empty image
//! - [`checker`] - Consistency checks
//! - [`injector`] - Add a host file to an unmounted image

pub mod allocator;
pub mod blob;
pub mod blobstore;
pub mod checker;
pub mod config;
pub mod digest;
pub mod error;
pub mod format;
pub mod header;
pub mod injector;
pub mod inode;
pub mod io;
pub mod merkle;
