//! # Blobfs - Content-Addressed Blob Filesystem
//!
//! `blobfs` stores immutable blobs named by the root digest of a SHA-256
//! Merkle tree over their content. A blob is written once, verified against
//! its name as the last byte arrives, and every read is checked against the
//! tree before any byte is returned.
//!
//! - **Flat namespace**: one root directory, every entry a digest
//! - **Contiguous extents**: each blob is one run of blocks, tree then data
//! - **Verified reads**: only the tree nodes covering a range are rehashed
//! - **Offline tools**: format, check and inject without mounting
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blobfs::{format, merkle, Blobstore, FormatOptions, MountOptions, Result};
//!
//! # fn main() -> Result<()> {
//! format("blobs.img", 1024, &FormatOptions::default())?;
//! let mut store = Blobstore::mount("blobs.img", MountOptions::default())?;
//!
//! let content = b"Hello, World!";
//! let digest = merkle::root_digest(content);
//!
//! let handle = store.create(&digest)?;
//! store.reserve(&handle, content.len() as u64)?;
//! store.write(&handle, content)?;
//! store.release(handle)?;
//!
//! let handle = store.open(&digest)?;
//! assert_eq!(store.read(&handle, 0, 5)?, b"Hello");
//! store.release(handle)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Offline Checks
//!
//! ```rust,no_run
//! use blobfs::{Checker, Result};
//!
//! # fn main() -> Result<()> {
//! let report = Checker::open("blobs.img")?.check();
//! println!("{} blobs, clean: {}", report.committed_inodes, report.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use self::core::{
    allocator, blob, blobstore, checker, config, digest, error, format, header, injector, inode,
    io,
};

pub use crate::core::{
    blob::{BlobFlags, BlobInfo, BlobState, ReadySignal},
    blobstore::{BlobHandle, Blobstore, Usage},
    checker::{CheckReport, Checker},
    config::{BlobfsConfig, FormatOptions, MountOptions},
    digest::{Digest, InvalidDigest},
    error::{BlobfsError, Result},
    format::format,
    header::{Superblock, BLOCK_SIZE},
    injector::inject,
    inode::Inode,
};

pub use crate::core::merkle;
