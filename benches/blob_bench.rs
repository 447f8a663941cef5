use criterion::{black_box, criterion_group, criterion_main, Criterion};
use blobvault::blob::BlobStore;
use blobvault::fsblob::view::migrate;
use blobvault::{EncryptedBlockStore, EncryptionKey, InMemoryBlockStore, Key};

const BLOCK_SIZE: usize = 32 * 1024;

fn bench_blob_io(c: &mut Criterion) {
    let data = vec![42u8; 1024 * 1024];

    c.bench_function("blob_write_1mb", |b| {
        let store = BlobStore::new(InMemoryBlockStore::new(), BLOCK_SIZE).unwrap();
        b.iter(|| {
            let mut blob = store.create().unwrap();
            blob.resize(data.len() as u64).unwrap();
            blob.write(0, black_box(&data)).unwrap();
            blob.remove().unwrap();
        })
    });

    let store = BlobStore::new(InMemoryBlockStore::new(), BLOCK_SIZE).unwrap();
    let mut blob = store.create().unwrap();
    blob.resize(data.len() as u64).unwrap();
    blob.write(0, &data).unwrap();
    c.bench_function("blob_read_all_1mb", |b| b.iter(|| black_box(blob.read_all().unwrap())));
}

fn bench_encrypted_io(c: &mut Criterion) {
    let data = vec![7u8; 256 * 1024];
    let blocks = EncryptedBlockStore::new(InMemoryBlockStore::new(), EncryptionKey::generate());
    let store = BlobStore::new(blocks, BLOCK_SIZE).unwrap();

    c.bench_function("encrypted_blob_write_256kb", |b| {
        b.iter(|| {
            let mut blob = store.create().unwrap();
            blob.resize(data.len() as u64).unwrap();
            blob.write(0, black_box(&data)).unwrap();
            blob.remove().unwrap();
        })
    });
}

fn bench_migration(c: &mut Criterion) {
    let mut legacy = vec![0x00, 0x00, 0x01];
    legacy.extend(std::iter::repeat(0xAB).take(512 * 1024));
    let store = BlobStore::new(InMemoryBlockStore::new(), BLOCK_SIZE).unwrap();
    let parent = Key::random();

    c.bench_function("migrate_legacy_512kb", |b| {
        b.iter(|| {
            let mut blob = store.create().unwrap();
            blob.resize(legacy.len() as u64).unwrap();
            blob.write(0, &legacy).unwrap();
            migrate(&mut blob, black_box(&parent)).unwrap();
            blob.remove().unwrap();
        })
    });
}

criterion_group!(benches, bench_blob_io, bench_encrypted_io, bench_migration);
criterion_main!(benches);
