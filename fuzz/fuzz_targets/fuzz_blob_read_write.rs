#![no_main]
use blobfs::{format, merkle, Blobstore, FormatOptions, MountOptions};
use libfuzzer_sys::{arbitrary::{Arbitrary, Unstructured}, fuzz_target};

#[derive(Debug, Arbitrary)]
struct BlobOp {
    data: Vec<u8>,
    chunk: u16,
    read_offset: u32,
    read_len: u16,
    /// Declare the digest of different content
    mismatch: bool,
}

fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let ops: Vec<BlobOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let temp = match tempfile::NamedTempFile::new() {
        Ok(t) => t,
        Err(_) => return,
    };
    if format(temp.path(), 128, &FormatOptions { inode_count: 128 }).is_err() {
        return;
    }
    let mut store = match Blobstore::mount(temp.path(), MountOptions::default()) {
        Ok(s) => s,
        Err(_) => return,
    };

    for op in ops.iter().take(8) {
        if op.data.is_empty() {
            continue;
        }

        let digest = if op.mismatch {
            merkle::root_digest(&[op.data.as_slice(), b"!"].concat())
        } else {
            merkle::root_digest(&op.data)
        };

        let handle = match store.create(&digest) {
            Ok(h) => h,
            Err(_) => continue,
        };

        if store.reserve(&handle, op.data.len() as u64).is_ok() {
            let chunk = (op.chunk as usize).max(1);
            for piece in op.data.chunks(chunk) {
                if store.write(&handle, piece).is_err() {
                    break;
                }
            }

            if let Ok(bytes) = store.read(&handle, op.read_offset as u64, op.read_len as u64) {
                let start = op.read_offset as usize;
                assert_eq!(bytes.as_slice(), &op.data[start..start + bytes.len()]);
            }
        }

        let _ = store.release(handle);
    }

    assert!(store.check().is_clean());
});
