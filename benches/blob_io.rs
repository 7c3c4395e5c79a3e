//! Benchmarks for the blob write and verified read paths

use blobfs::{format, merkle, Blobstore, FormatOptions, MountOptions, BLOCK_SIZE};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::NamedTempFile;

const SIZES: [usize; 3] = [4 * 1024, 256 * 1024, 4 * 1024 * 1024];

fn content(size: usize, seed: u64) -> Vec<u8> {
    (0..size)
        .map(|i| (i as u64).wrapping_mul(2654435761).wrapping_add(seed) as u8)
        .collect()
}

fn fresh_store() -> (NamedTempFile, Blobstore) {
    let temp = NamedTempFile::new().unwrap();
    format(temp.path(), 4096, &FormatOptions { inode_count: 1024 }).unwrap();
    let store = Blobstore::mount(temp.path(), MountOptions::default()).unwrap();
    (temp, store)
}

fn benchmark_merkle_root(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle_root");

    for size in SIZES.iter() {
        let data = content(*size, 0);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(merkle::root_digest(data)));
        });
    }

    group.finish();
}

fn benchmark_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("blob_write");
    group.sample_size(20);

    for size in SIZES.iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (_temp, mut store) = fresh_store();
            let mut seed = 0u64;

            b.iter(|| {
                seed += 1;
                let data = content(size, seed);
                let handle = store.create(&merkle::root_digest(&data)).unwrap();
                store.reserve(&handle, size as u64).unwrap();
                store.write(&handle, &data).unwrap();

                // Unlink so the image never fills up
                store.unlink(&handle).unwrap();
                store.release(handle).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("blob_read_block");

    for size in SIZES.iter() {
        let (_temp, mut store) = fresh_store();
        let data = content(*size, 7);
        let digest = merkle::root_digest(&data);
        let handle = store.create(&digest).unwrap();
        store.reserve(&handle, data.len() as u64).unwrap();
        store.write(&handle, &data).unwrap();

        let len = BLOCK_SIZE.min(*size) as u64;
        group.throughput(Throughput::Bytes(len));
        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| black_box(store.read(&handle, 0, len).unwrap()));
        });

        store.release(handle).unwrap();
    }

    group.finish();
}

criterion_group!(benches, benchmark_merkle_root, benchmark_write, benchmark_read);
criterion_main!(benches);
