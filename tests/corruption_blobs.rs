//! Integrity and corruption detection tests
//!
//! Content that does not hash to its name is never committed, and bytes
//! altered on disk are caught on read or by the checker.

use blobfs::{
    format, merkle, BlobState, BlobfsError, Blobstore, Checker, FormatOptions, MountOptions,
    BLOCK_SIZE,
};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

fn image(blocks: u64) -> NamedTempFile {
    let temp = NamedTempFile::new().unwrap();
    format(temp.path(), blocks, &FormatOptions { inode_count: 128 }).unwrap();
    temp
}

/// Helper: overwrite bytes at `offset` within `block`
fn corrupt_block(path: &Path, block: u64, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(block * BLOCK_SIZE as u64 + offset))
        .unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
}

#[test]
fn test_mismatched_content_rejected() {
    let temp = image(64);
    let mut store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();
    let declared = merkle::root_digest(b"the real content");

    let handle = store.create(&declared).unwrap();
    store.reserve(&handle, 16).unwrap();
    let result = store.write(&handle, b"some other bytes");
    assert!(matches!(result, Err(BlobfsError::BadState(_))));
    assert_eq!(store.stat(&handle).unwrap().state, BlobState::Error);

    // Nothing was committed
    assert_eq!(store.usage().alloc_inode_count, 0);
    assert_eq!(store.usage().alloc_block_count, 0);
    assert!(store.list_blobs().is_empty());
    assert!(matches!(
        store.read(&handle, 0, 1),
        Err(BlobfsError::BadState(_))
    ));

    // The name is free again once the errored handle is gone
    store.release(handle).unwrap();
    let handle = store.create(&declared).unwrap();
    store.reserve(&handle, 16).unwrap();
    store.write(&handle, b"the real content").unwrap();
    store.release(handle).unwrap();

    drop(store);
    assert!(Checker::open(temp.path()).unwrap().check().is_clean());
}

#[test]
fn test_on_disk_corruption_detected_on_read() {
    let temp = image(64);
    let content: Vec<u8> = (0..5 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    let digest = merkle::root_digest(&content);

    let inode = {
        let mut store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();
        let handle = store.create(&digest).unwrap();
        store.reserve(&handle, content.len() as u64).unwrap();
        store.write(&handle, &content).unwrap();
        store.release(handle).unwrap();
        store.volume().node_map().find_committed(&digest).unwrap().1
    };
    assert_eq!(inode.tree_blocks(), 1);

    // Flip bytes in the last data block
    corrupt_block(temp.path(), inode.data_start_block() + 4, 100, &[0xFF; 4]);

    let mut store = Blobstore::mount(temp.path(), MountOptions::default().cache_blocks(0)).unwrap();
    let handle = store.open(&digest).unwrap();

    // Ranges that avoid the damaged leaf still verify
    assert_eq!(
        store.read(&handle, 0, 2 * BLOCK_SIZE as u64).unwrap(),
        &content[..2 * BLOCK_SIZE]
    );
    assert!(matches!(
        store.read(&handle, 4 * BLOCK_SIZE as u64, 200),
        Err(BlobfsError::BadState(_))
    ));

    // The blob stays readable where it is intact
    assert_eq!(store.stat(&handle).unwrap().state, BlobState::Readable);
    assert_eq!(store.read(&handle, BLOCK_SIZE as u64, 10).unwrap(), &content[BLOCK_SIZE..BLOCK_SIZE + 10]);
    store.release(handle).unwrap();
}

#[test]
fn test_corrupted_tree_detected() {
    let temp = image(64);
    let content = vec![0x5Au8; 3 * BLOCK_SIZE];
    let digest = merkle::root_digest(&content);

    let start_block = {
        let mut store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();
        let handle = store.create(&digest).unwrap();
        store.reserve(&handle, content.len() as u64).unwrap();
        store.write(&handle, &content).unwrap();
        store.release(handle).unwrap();
        store.volume().node_map().find_committed(&digest).unwrap().1.start_block
    };

    corrupt_block(temp.path(), start_block, 0, &[0u8; 8]);

    let mut store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();
    let handle = store.open(&digest).unwrap();
    assert!(store.read(&handle, 0, 10).is_err());
    store.release(handle).unwrap();
}

#[test]
fn test_corrupted_superblock_rejected() {
    let temp = image(64);
    corrupt_block(temp.path(), 0, 0, &[0u8; 8]);

    assert!(matches!(
        Blobstore::mount(temp.path(), MountOptions::default()),
        Err(BlobfsError::InvalidArgs(_))
    ));
    assert!(matches!(
        Checker::open(temp.path()),
        Err(BlobfsError::InvalidArgs(_))
    ));
}

#[test]
fn test_truncated_image_rejected() {
    let temp = image(64);
    let file = OpenOptions::new().write(true).open(temp.path()).unwrap();
    file.set_len(32 * BLOCK_SIZE as u64).unwrap();
    drop(file);

    assert!(matches!(
        Blobstore::mount(temp.path(), MountOptions::default()),
        Err(BlobfsError::InvalidArgs(_))
    ));
}

#[test]
fn test_cleared_bitmap_bit_reported() {
    let temp = image(64);
    let content = b"tracked".to_vec();
    {
        let mut store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();
        let handle = store.create(&merkle::root_digest(&content)).unwrap();
        store.reserve(&handle, content.len() as u64).unwrap();
        store.write(&handle, &content).unwrap();
        store.release(handle).unwrap();
    }

    // Zero the bitmap block; the header bits and the blob's bit are lost
    corrupt_block(temp.path(), 1, 0, &[0u8; 8]);

    let checker = Checker::open(temp.path()).unwrap();
    let report = checker.check();
    assert!(!report.is_clean());
    assert!(report.errors.len() >= 2);
}

#[test]
fn test_short_inode_extent_rejected_on_open() {
    let temp = image(64);
    let content = vec![0x33u8; 2 * BLOCK_SIZE + 100];
    let digest = merkle::root_digest(&content);

    let (inode_table, inode) = {
        let mut store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();
        let handle = store.create(&digest).unwrap();
        store.reserve(&handle, content.len() as u64).unwrap();
        store.write(&handle, &content).unwrap();
        store.release(handle).unwrap();
        let table = store.superblock().inode_table_start();
        (table, store.volume().node_map().find_committed(&digest).unwrap().1)
    };
    assert_eq!(inode.block_count, 4);

    // Inode 0 block_count (bytes 40..48) shrunk to one block
    corrupt_block(temp.path(), inode_table, 40, &1u64.to_le_bytes());

    let mut store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();
    assert!(matches!(
        store.open(&digest),
        Err(BlobfsError::BadState(_))
    ));
    assert!(matches!(
        store.lookup(&digest),
        Err(BlobfsError::BadState(_))
    ));
    drop(store);

    assert!(!Checker::open(temp.path()).unwrap().check().is_clean());
}

#[test]
fn test_inode_extent_outside_data_region_rejected() {
    let temp = image(64);
    let content = b"relocated".to_vec();
    let digest = merkle::root_digest(&content);

    let inode_table = {
        let mut store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();
        let handle = store.create(&digest).unwrap();
        store.reserve(&handle, content.len() as u64).unwrap();
        store.write(&handle, &content).unwrap();
        store.release(handle).unwrap();
        store.superblock().inode_table_start()
    };

    // Inode 0 start_block (bytes 32..40) pointed past the end of the image
    corrupt_block(temp.path(), inode_table, 32, &64u64.to_le_bytes());

    let mut store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();
    assert!(matches!(
        store.open(&digest),
        Err(BlobfsError::BadState(_))
    ));
}
