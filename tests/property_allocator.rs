//! Property-based tests for allocator correctness
//!
//! Random sequences of creates and unlinks must never hand out overlapping
//! extents, and the counters must always agree with the bitmap and inode table.

use blobfs::core::allocator::block_map::BlockMap;
use blobfs::{format, merkle, BlobfsError, Blobstore, Checker, FormatOptions, MountOptions};
use proptest::prelude::*;
use tempfile::NamedTempFile;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_extents_disjoint_and_counts_consistent(
        sizes in prop::collection::vec(1usize..40_000, 1..16),
        unlink_mask in any::<u16>(),
    ) {
        let temp = NamedTempFile::new().unwrap();
        format(temp.path(), 96, &FormatOptions { inode_count: 128 }).unwrap();
        let mut store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();

        let mut stored = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let mut content = vec![0xA5u8; size];
            content[0] = i as u8;
            let digest = merkle::root_digest(&content);

            let handle = store.create(&digest).unwrap();
            match store.reserve(&handle, size as u64) {
                Ok(()) => {
                    store.write(&handle, &content).unwrap();
                    stored.push(digest);
                }
                Err(BlobfsError::NoSpace) => {}
                Err(e) => panic!("unexpected reserve error: {}", e),
            }
            store.release(handle).unwrap();
        }

        for (i, digest) in stored.iter().enumerate() {
            if unlink_mask & (1 << i) != 0 {
                let handle = store.lookup(digest).unwrap();
                store.unlink(&handle).unwrap();
                store.release(handle).unwrap();
            }
        }

        let report = store.check();
        prop_assert!(report.is_clean(), "{:?}", report.errors);

        drop(store);
        let checker = Checker::open(temp.path()).unwrap();
        prop_assert!(checker.verify_counts().is_ok());
        prop_assert!(checker.verify_extents().is_ok());
    }

    #[test]
    fn prop_block_map_reservations_never_overlap(
        requests in prop::collection::vec(1u64..20, 1..40),
    ) {
        let mut map = BlockMap::new(256, 8);
        let mut owned = vec![false; 256];

        for n in requests {
            match map.allocate_contiguous(n) {
                Ok(start) => {
                    prop_assert!(start >= 8);
                    prop_assert!(start + n <= 256);
                    for block in start..start + n {
                        prop_assert!(!owned[block as usize], "block {} handed out twice", block);
                        owned[block as usize] = true;
                    }
                }
                Err(BlobfsError::NoSpace) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }
}
