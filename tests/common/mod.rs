#![allow(dead_code)]

pub use blobvault::blockstore::testutils::FailingBlockStore;

/// Body bytes that are easy to tell apart at any offset.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

/// Raw legacy blob content: version 0, entry type, body.
pub fn legacy_content(entry_type: u8, body: &[u8]) -> Vec<u8> {
    let mut content = vec![0x00, 0x00, entry_type];
    content.extend_from_slice(body);
    content
}
