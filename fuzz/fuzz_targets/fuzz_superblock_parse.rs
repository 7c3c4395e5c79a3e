#![no_main]
use blobfs::Superblock;
use libfuzzer_sys::fuzz_target;

// Arbitrary block 0 contents must parse or be rejected, never panic
fuzz_target!(|data: &[u8]| {
    if let Ok(sb) = Superblock::from_bytes(data) {
        // Accepted superblocks describe a usable layout
        assert!(sb.data_start() < sb.block_count);
        assert!(sb.alloc_block_count <= sb.data_blocks());

        let reparsed = Superblock::from_bytes(&sb.to_bytes()).expect("re-parse");
        assert_eq!(reparsed, sb);
    }
});
