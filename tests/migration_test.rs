mod common;

use std::sync::Arc;

use blobvault::blob::{Blob, BlobStore};
use blobvault::fsblob::layout::{FORMAT_VERSION_HEADER, HEADER_SIZE, OLD_HEADER_SIZE};
use blobvault::fsblob::view::{get_format_version_header, migrate};
use blobvault::{EntryType, FsBlobStore, FsBlobView, InMemoryBlockStore, Key, KEY_SIZE};

use common::{legacy_content, pattern, FailingBlockStore};

// 56 bytes per leaf, 3 children per inner node: small bodies already need
// multi-level trees.
const SMALL_BLOCK: usize = 64;

fn write_raw<B: blobvault::BlockStore>(store: &BlobStore<B>, content: &[u8]) -> Blob<B> {
    let mut blob = store.create().unwrap();
    blob.resize(content.len() as u64).unwrap();
    blob.write(0, content).unwrap();
    blob
}

fn expected_after_migration(entry_type: u8, parent: &Key, body: &[u8]) -> Vec<u8> {
    let mut expected = Vec::with_capacity(HEADER_SIZE + body.len());
    expected.extend_from_slice(&FORMAT_VERSION_HEADER.to_le_bytes());
    expected.push(entry_type);
    expected.extend_from_slice(parent.as_bytes());
    expected.extend_from_slice(body);
    expected
}

#[test]
fn hello_file_migrates_to_current_layout() {
    let store = BlobStore::new(InMemoryBlockStore::new(), SMALL_BLOCK).unwrap();
    let parent = Key::random();
    let mut blob = write_raw(&store, b"\x00\x00\x01hello");

    migrate(&mut blob, &parent).unwrap();

    let raw = blob.read_all().unwrap();
    assert_eq!(raw.len(), OLD_HEADER_SIZE + 5 + KEY_SIZE);
    assert_ne!(get_format_version_header(&blob).unwrap(), 0);
    assert_eq!(raw[2], 0x01);
    assert_eq!(&raw[3..19], parent.as_bytes());
    assert_eq!(&raw[19..], b"hello");
}

#[test]
fn migrated_body_matches_for_many_sizes() {
    let store = BlobStore::new(InMemoryBlockStore::new(), SMALL_BLOCK).unwrap();
    for len in [0usize, 1, 36, 37, 53, 54, 55, 100, 500, 1234] {
        let body = pattern(len);
        let parent = Key::random();
        let mut blob = write_raw(&store, &legacy_content(0x01, &body));
        migrate(&mut blob, &parent).unwrap();

        let view = FsBlobView::new(blob).unwrap();
        assert_eq!(view.read_all_body().unwrap(), body, "body length {len}");
        assert_eq!(view.parent().unwrap(), parent);
        assert_eq!(view.entry_type().unwrap(), EntryType::File);
        view.remove().unwrap();
    }
    assert_eq!(store.num_blocks().unwrap(), 0);
}

#[test]
fn interrupted_migration_is_retryable() {
    let parent = Key::from_bytes([0x5A; KEY_SIZE]);
    let body = pattern(400);
    let original = legacy_content(0x00, &body);
    let expected = expected_after_migration(0x00, &parent, &body);

    let mut failures = 0;
    for fail_after in 0.. {
        let base = Arc::new(FailingBlockStore::new(InMemoryBlockStore::new()));
        let store = BlobStore::from_arc(Arc::clone(&base), SMALL_BLOCK).unwrap();
        let mut blob = write_raw(&store, &original);

        base.fail_after(fail_after);
        let result = migrate(&mut blob, &parent);
        base.disarm();

        match result {
            Err(_) => {
                failures += 1;
                assert_eq!(get_format_version_header(&blob).unwrap(), 0, "failure point {fail_after}");
                assert_eq!(blob.read_all().unwrap(), original, "failure point {fail_after}");

                migrate(&mut blob, &parent).unwrap();
                assert_eq!(blob.read_all().unwrap(), expected, "retry after failure point {fail_after}");
            }
            Ok(()) => {
                assert_eq!(blob.read_all().unwrap(), expected);
                break;
            }
        }
    }
    assert!(failures > 0);
}

#[test]
fn load_migrates_once_then_reads_current_header() {
    let fs = FsBlobStore::from_blob_store(BlobStore::new(InMemoryBlockStore::new(), SMALL_BLOCK).unwrap(), true);
    let parent = Key::random();
    let key = *write_raw(fs.blob_store(), &legacy_content(0x01, b"legacy file")).key();

    let file = fs.load(&key, &parent).unwrap().unwrap().into_file().unwrap();
    assert_eq!(file.read_all().unwrap(), b"legacy file");
    drop(file);

    // A different hint on the second load must not change the stored parent.
    let again = fs.load(&key, &Key::random()).unwrap().unwrap();
    assert_eq!(again.parent().unwrap(), parent);
    assert_eq!(again.entry_type(), EntryType::File);
}

#[test]
fn root_directory_migrates_with_zero_parent() {
    let fs = FsBlobStore::from_blob_store(BlobStore::new(InMemoryBlockStore::new(), SMALL_BLOCK).unwrap(), true);
    let key = *write_raw(fs.blob_store(), &legacy_content(0x00, b"")).key();

    let root = fs.load(&key, &Key::zero()).unwrap().unwrap().into_dir().unwrap();
    assert_eq!(root.num_entries(), 0);
    assert_eq!(root.view().parent().unwrap(), Key::zero());
}
