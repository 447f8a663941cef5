//! Blobs: resizable byte streams stored as trees of blocks.
//!
//! A [`Blob`] is identified by the key of its root block, which never changes
//! over the blob's lifetime.  Small blobs are a single leaf block; larger ones
//! grow a tree (see [`tree`]) that callers never see.
//!
//! Every mutation is written through to the block store immediately.  For
//! multi-step updates that must land atomically, [`Blob::transaction`]
//! stages all writes and publishes them with a single root-block write.

use std::sync::Arc;

use thiserror::Error;

use crate::blockstore::{BlockStore, BlockStoreError};
use crate::key::Key;

pub mod node;
mod transaction;
mod tree;

pub use node::{NodeLayout, MIN_BLOCK_SIZE, NODE_HEADER_SIZE};
pub use transaction::StagedBlockStore;

use node::DataNode;
use tree::DataTree;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Block store error: {0}")]
    Io(#[from] BlockStoreError),
    #[error("Range {offset}+{len} is outside blob of size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },
    #[error("Blob node {0} is missing from the block store")]
    MissingNode(Key),
    #[error("Blob node {key} is corrupt: {reason}")]
    CorruptNode { key: Key, reason: String },
    #[error("Block size {0} is too small (minimum {MIN_BLOCK_SIZE} bytes)")]
    InvalidBlockSize(usize),
}

pub type Result<T> = std::result::Result<T, BlobError>;

// ── BlobStore ────────────────────────────────────────────────────────────────

/// Creates, opens and removes blobs on top of a shared block store.
pub struct BlobStore<B: BlockStore> {
    store:  Arc<B>,
    layout: NodeLayout,
}

impl<B: BlockStore> BlobStore<B> {
    pub fn new(store: B, block_size: usize) -> Result<Self> {
        Self::from_arc(Arc::new(store), block_size)
    }

    pub fn from_arc(store: Arc<B>, block_size: usize) -> Result<Self> {
        Ok(Self { store, layout: NodeLayout::new(block_size)? })
    }

    pub fn create(&self) -> Result<Blob<B>> {
        let key = self.store.create_with(&DataNode::Leaf(Vec::new()).encode())?;
        tracing::debug!(blob = %key, "created blob");
        Ok(Blob { key, store: Arc::clone(&self.store), layout: self.layout })
    }

    /// Open the blob rooted at `key`, or `None` if there is no such block.
    pub fn load(&self, key: &Key) -> Result<Option<Blob<B>>> {
        if !self.store.exists(key)? {
            return Ok(None);
        }
        Ok(Some(Blob { key: *key, store: Arc::clone(&self.store), layout: self.layout }))
    }

    /// Remove the blob rooted at `key` and all its blocks.
    pub fn remove(&self, key: &Key) -> Result<bool> {
        match self.load(key)? {
            Some(blob) => {
                blob.remove()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn num_blocks(&self) -> Result<u64> {
        Ok(self.store.num_blocks()?)
    }

    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    pub fn block_store(&self) -> &Arc<B> {
        &self.store
    }
}

// ── Blob ─────────────────────────────────────────────────────────────────────

pub struct Blob<B: BlockStore> {
    key:    Key,
    store:  Arc<B>,
    layout: NodeLayout,
}

impl<B: BlockStore> Blob<B> {
    fn tree(&self) -> DataTree<'_, B> {
        DataTree::new(&*self.store, self.layout, self.key)
    }

    #[inline]
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    /// Number of logically valid bytes.
    pub fn size(&self) -> Result<u64> {
        self.tree().size()
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        let tree = self.tree();
        let size = tree.size()?;
        let mut buf = zeroed(size)?;
        tree.read_into(0, &mut buf)?;
        Ok(buf)
    }

    /// Read exactly `len` bytes at `offset`; the range must lie within the blob.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let tree = self.tree();
        check_range(offset, len, tree.size()?)?;
        let mut buf = zeroed(len as u64)?;
        tree.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let tree = self.tree();
        check_range(offset, buf.len(), tree.size()?)?;
        tree.read_into(offset, buf)
    }

    /// Read up to `buf.len()` bytes at `offset`, stopping at the end of the
    /// blob.  Returns the number of bytes read.
    pub fn try_read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let tree = self.tree();
        let size = tree.size()?;
        if offset >= size {
            return Ok(0);
        }
        let n = to_usize((size - offset).min(buf.len() as u64))?;
        tree.read_into(offset, &mut buf[..n])?;
        Ok(n)
    }

    /// Overwrite bytes in place.  Writing past the end fails; grow the blob
    /// with [`resize`](Self::resize) first.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let tree = self.tree();
        check_range(offset, data.len(), tree.size()?)?;
        tree.write_at(offset, data)
    }

    /// Grow (zero-filled) or shrink (releasing unused blocks) to `new_size`.
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        self.tree().resize(new_size)
    }

    /// Number of blocks making up this blob.
    pub fn num_nodes(&self) -> Result<u64> {
        self.tree().num_nodes()
    }

    /// Release every block of this blob.
    pub fn remove(self) -> Result<()> {
        self.tree().remove_all()?;
        tracing::debug!(blob = %self.key, "removed blob");
        Ok(())
    }

    /// Run `f` against a staged view of this blob and publish its writes
    /// atomically if it succeeds.
    ///
    /// Inside `f` every read sees the staged writes.  If `f` fails nothing
    /// reaches the block store.  If the commit itself fails before the root
    /// block is rewritten, the blob is left exactly as it was.
    pub fn transaction<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Blob<StagedBlockStore<Arc<B>>>) -> std::result::Result<T, E>,
        E: From<BlobError>,
    {
        let staged = Arc::new(StagedBlockStore::new(Arc::clone(&self.store)));
        let mut staged_blob = Blob { key: self.key, store: Arc::clone(&staged), layout: self.layout };
        let value = f(&mut staged_blob)?;
        staged.commit(&self.key, self.layout)?;
        Ok(value)
    }
}

fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    let len = len as u64;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(BlobError::OutOfRange { offset, len, size }),
    }
}

/// Allocate a zeroed buffer, failing instead of aborting when `len` bytes
/// cannot be had.
fn zeroed(len: u64) -> Result<Vec<u8>> {
    let len = to_usize(len)?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| BlobError::OutOfRange { offset: 0, len: len as u64, size: isize::MAX as u64 })?;
    buf.resize(len, 0);
    Ok(buf)
}

fn to_usize(n: u64) -> Result<usize> {
    usize::try_from(n).map_err(|_| BlobError::OutOfRange { offset: 0, len: n, size: usize::MAX as u64 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::testutils::FailingBlockStore;
    use crate::blockstore::InMemoryBlockStore;
    use proptest::prelude::*;

    // 56 data bytes per leaf, 3 children per inner node.
    const SMALL_BLOCK: usize = 64;

    fn small_store() -> BlobStore<InMemoryBlockStore> {
        BlobStore::new(InMemoryBlockStore::new(), SMALL_BLOCK).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn new_blob_is_empty() {
        let store = small_store();
        let blob = store.create().unwrap();
        assert_eq!(blob.size().unwrap(), 0);
        assert_eq!(blob.read_all().unwrap(), Vec::<u8>::new());
        assert_eq!(blob.num_nodes().unwrap(), 1);
    }

    #[test]
    fn grows_into_multi_level_tree_and_back() {
        let store = small_store();
        let mut blob = store.create().unwrap();
        let data = pattern(1000);

        blob.resize(1000).unwrap();
        blob.write(0, &data).unwrap();
        assert_eq!(blob.size().unwrap(), 1000);
        assert_eq!(blob.read_all().unwrap(), data);
        // 18 leaves under 6 inner nodes under 2 more under the root
        assert_eq!(blob.num_nodes().unwrap(), 18 + 6 + 2 + 1);
        assert_eq!(store.num_blocks().unwrap(), 27);

        blob.resize(100).unwrap();
        assert_eq!(blob.read_all().unwrap(), &data[..100]);
        assert_eq!(blob.num_nodes().unwrap(), 3);
        assert_eq!(store.num_blocks().unwrap(), 3);

        blob.resize(0).unwrap();
        assert_eq!(blob.num_nodes().unwrap(), 1);
        assert_eq!(store.num_blocks().unwrap(), 1);
    }

    #[test]
    fn root_key_is_stable_across_resizes() {
        let store = small_store();
        let mut blob = store.create().unwrap();
        let key = *blob.key();
        blob.resize(5000).unwrap();
        blob.write(4990, b"tail bytes").unwrap();
        let reopened = store.load(&key).unwrap().unwrap();
        assert_eq!(reopened.read(4990, 10).unwrap(), b"tail bytes");
    }

    #[test]
    fn shrink_then_grow_reads_zero() {
        let store = small_store();
        let mut blob = store.create().unwrap();
        blob.resize(300).unwrap();
        blob.write(0, &[0xAA; 300]).unwrap();
        blob.resize(10).unwrap();
        blob.resize(300).unwrap();
        let content = blob.read_all().unwrap();
        assert_eq!(&content[..10], &[0xAA; 10]);
        assert!(content[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let store = small_store();
        let mut blob = store.create().unwrap();
        blob.resize(10).unwrap();
        assert!(matches!(blob.read(5, 6), Err(BlobError::OutOfRange { offset: 5, len: 6, size: 10 })));
        assert!(matches!(blob.write(8, b"abc"), Err(BlobError::OutOfRange { .. })));
        assert!(matches!(blob.read(u64::MAX, 2), Err(BlobError::OutOfRange { .. })));
        assert!(blob.read(10, 0).unwrap().is_empty());
    }

    #[test]
    fn oversized_read_fails_without_allocating() {
        let store = small_store();
        let mut blob = store.create().unwrap();
        blob.resize(10).unwrap();
        assert!(matches!(
            blob.read(0, usize::MAX),
            Err(BlobError::OutOfRange { offset: 0, size: 10, .. })
        ));
        assert!(matches!(blob.read(5, usize::MAX - 2), Err(BlobError::OutOfRange { .. })));
    }

    // Root at depth 100 over a chain of single-child nodes down to a leaf.
    fn forge_deep_tree(store: &BlobStore<InMemoryBlockStore>, root_depth: u8) -> Key {
        let blocks = store.block_store();
        let mut below = blocks.create_with(&DataNode::Leaf(vec![1; 4]).encode()).unwrap();
        for depth in 1..root_depth {
            below = blocks.create_with(&DataNode::Inner { depth, children: vec![below] }.encode()).unwrap();
        }
        blocks
            .create_with(&DataNode::Inner { depth: root_depth, children: vec![below, below] }.encode())
            .unwrap()
    }

    #[test]
    fn forged_deep_tree_is_reported_corrupt() {
        let store = small_store();
        let key = forge_deep_tree(&store, 100);
        let blob = store.load(&key).unwrap().unwrap();
        assert!(matches!(blob.size(), Err(BlobError::CorruptNode { key: k, .. }) if k == key));
        assert!(matches!(blob.read_all(), Err(BlobError::CorruptNode { .. })));
        let mut buf = [0u8; 4];
        assert!(matches!(blob.try_read(0, &mut buf), Err(BlobError::CorruptNode { .. })));
    }

    #[test]
    fn resize_beyond_capacity_is_rejected() {
        let store = small_store();
        let mut blob = store.create().unwrap();
        blob.resize(100).unwrap();
        blob.write(0, &pattern(100)).unwrap();
        assert!(matches!(blob.resize(u64::MAX), Err(BlobError::OutOfRange { .. })));
        assert_eq!(blob.read_all().unwrap(), pattern(100));
        assert_eq!(store.num_blocks().unwrap(), blob.num_nodes().unwrap());
    }

    #[test]
    fn try_read_stops_at_end() {
        let store = small_store();
        let mut blob = store.create().unwrap();
        blob.resize(5).unwrap();
        blob.write(0, b"hello").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(blob.try_read(2, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"llo");
        assert_eq!(blob.try_read(5, &mut buf).unwrap(), 0);
        assert_eq!(blob.try_read(50, &mut buf).unwrap(), 0);
    }

    #[test]
    fn remove_releases_all_blocks() {
        let store = small_store();
        let keep = store.create().unwrap();
        let mut blob = store.create().unwrap();
        blob.resize(2000).unwrap();
        let key = *blob.key();
        assert!(store.num_blocks().unwrap() > 2);
        assert!(store.remove(&key).unwrap());
        assert_eq!(store.num_blocks().unwrap(), 1);
        assert!(store.load(&key).unwrap().is_none());
        assert!(!store.remove(&key).unwrap());
        assert_eq!(keep.size().unwrap(), 0);
    }

    #[test]
    fn missing_node_surfaces_as_error() {
        let store = small_store();
        let mut blob = store.create().unwrap();
        blob.resize(500).unwrap();
        let root = store.block_store().load(blob.key()).unwrap().unwrap();
        let node = DataNode::decode(blob.key(), &root, &store.layout()).unwrap();
        let DataNode::Inner { children, .. } = node else { panic!("expected inner root") };
        store.block_store().remove(&children[0]).unwrap();
        assert!(matches!(blob.read_all(), Err(BlobError::MissingNode(k)) if k == children[0]));
    }

    #[test]
    fn transaction_publishes_all_writes() {
        let store = small_store();
        let mut blob = store.create().unwrap();
        blob.resize(200).unwrap();
        blob.write(0, &pattern(200)).unwrap();

        blob.transaction(|b| {
            b.resize(400)?;
            b.write(300, b"staged")?;
            assert_eq!(b.read(300, 6)?, b"staged");
            Ok::<_, BlobError>(())
        })
        .unwrap();

        assert_eq!(blob.size().unwrap(), 400);
        assert_eq!(blob.read(300, 6).unwrap(), b"staged");
        assert_eq!(blob.read(0, 200).unwrap(), pattern(200));
        // no retired or orphaned blocks remain
        assert_eq!(store.num_blocks().unwrap(), blob.num_nodes().unwrap());
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let store = small_store();
        let mut blob = store.create().unwrap();
        blob.resize(200).unwrap();
        blob.write(0, &pattern(200)).unwrap();
        let blocks_before = store.num_blocks().unwrap();

        let result = blob.transaction(|b| {
            b.resize(1000)?;
            b.write(0, b"doomed")?;
            Err::<(), _>(BlobError::InvalidBlockSize(0))
        });

        assert!(result.is_err());
        assert_eq!(blob.read_all().unwrap(), pattern(200));
        assert_eq!(store.num_blocks().unwrap(), blocks_before);
    }

    #[test]
    fn interrupted_commit_leaves_blob_untouched() {
        for fail_after in 0..40 {
            let base = Arc::new(FailingBlockStore::new(InMemoryBlockStore::new()));
            let store = BlobStore::from_arc(Arc::clone(&base), SMALL_BLOCK).unwrap();
            let mut blob = store.create().unwrap();
            blob.resize(200).unwrap();
            blob.write(0, &pattern(200)).unwrap();

            base.fail_after(fail_after);
            let result = blob.transaction(|b| {
                b.resize(700)?;
                b.write(0, b"new head")?;
                b.write(690, b"new tail!!")
            });
            base.disarm();

            let content = blob.read_all().unwrap();
            match result {
                Ok(()) => {
                    assert_eq!(content.len(), 700);
                    assert_eq!(&content[..8], b"new head");
                    assert_eq!(&content[690..], b"new tail!!");
                }
                Err(_) => assert_eq!(content, pattern(200), "failure point {fail_after}"),
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn resize_sets_size_and_zero_fills(
            initial in 0u64..2000,
            target in 0u64..2000,
        ) {
            let store = small_store();
            let mut blob = store.create().unwrap();
            blob.resize(initial).unwrap();
            blob.write(0, &vec![0xFF; initial as usize]).unwrap();
            blob.resize(target).unwrap();
            prop_assert_eq!(blob.size().unwrap(), target);
            let content = blob.read_all().unwrap();
            let kept = initial.min(target) as usize;
            prop_assert!(content[..kept].iter().all(|&b| b == 0xFF));
            prop_assert!(content[kept..].iter().all(|&b| b == 0));
            prop_assert_eq!(store.num_blocks().unwrap(), blob.num_nodes().unwrap());
        }

        #[test]
        fn write_then_read_returns_written_bytes(
            size in 1u64..1500,
            offset_frac in 0.0f64..1.0,
            data in proptest::collection::vec(any::<u8>(), 0..300),
        ) {
            let store = small_store();
            let mut blob = store.create().unwrap();
            blob.resize(size).unwrap();
            let offset = ((size as f64) * offset_frac) as u64;
            let len = data.len().min((size - offset) as usize);
            blob.write(offset, &data[..len]).unwrap();
            prop_assert_eq!(blob.read(offset, len).unwrap(), &data[..len]);
        }
    }
}
