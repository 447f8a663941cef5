//! Keyed block storage: the bottom layer everything else is built on.
//!
//! A [`BlockStore`] maps a [`Key`] to an opaque byte payload.  Every operation
//! is atomic for a single block; nothing here spans blocks.  Implementations
//! take `&self` and serialize internally so one store can be shared by many
//! blobs behind an `Arc`.
//!
//! | Store | Backing |
//! |-------|---------|
//! | [`InMemoryBlockStore`] | `HashMap`, for tests and scratch filesystems |
//! | [`OnDiskBlockStore`]   | one file per block under a base directory |
//! | [`EncryptedBlockStore`] | AES-256-GCM adapter over any other store |

use std::io;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::key::Key;

pub mod encrypted;
pub mod memory;
pub mod ondisk;

pub use encrypted::EncryptedBlockStore;
pub use memory::InMemoryBlockStore;
pub use ondisk::OnDiskBlockStore;

#[derive(Error, Debug)]
pub enum BlockStoreError {
    #[error("Block {0} not found")]
    NotFound(Key),
    #[error("Block {key} is corrupted: {reason}")]
    Corrupted { key: Key, reason: String },
    #[error("Block {0} failed authentication (tampered, swapped or wrong key)")]
    IntegrityViolation(Key),
    #[error("Block {key} has unsupported format version {version}")]
    UnsupportedFormat { key: Key, version: u16 },
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, BlockStoreError>;

pub trait BlockStore: Send + Sync {
    /// Write `data` under `key` unless the key is taken.  Returns `false`
    /// without touching anything if a block already exists there.
    fn try_create(&self, key: &Key, data: &[u8]) -> Result<bool>;

    fn load(&self, key: &Key) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite the block at `key`.
    fn store(&self, key: &Key, data: &[u8]) -> Result<()>;

    /// Returns `false` if there was no such block.
    fn remove(&self, key: &Key) -> Result<bool>;

    fn num_blocks(&self) -> Result<u64>;

    fn exists(&self, key: &Key) -> Result<bool> {
        Ok(self.load(key)?.is_some())
    }

    /// Change the payload length of an existing block.  Growing appends
    /// zero bytes, shrinking drops the tail.
    fn resize(&self, key: &Key, new_size: usize) -> Result<()> {
        let mut data = self.load(key)?.ok_or(BlockStoreError::NotFound(*key))?;
        data.resize(new_size, 0);
        self.store(key, &data)
    }

    /// Store `data` under a fresh random key.
    fn create_with(&self, data: &[u8]) -> Result<Key> {
        loop {
            let key = Key::random();
            if self.try_create(&key, data)? {
                return Ok(key);
            }
        }
    }

    /// Allocate a fresh random key holding an empty block.
    fn create(&self) -> Result<Key> {
        self.create_with(&[])
    }
}

macro_rules! forward_block_store {
    ($($ty:ty),*) => {$(
        impl<S: BlockStore + ?Sized> BlockStore for $ty {
            fn try_create(&self, key: &Key, data: &[u8]) -> Result<bool> { (**self).try_create(key, data) }
            fn load(&self, key: &Key) -> Result<Option<Vec<u8>>>         { (**self).load(key) }
            fn store(&self, key: &Key, data: &[u8]) -> Result<()>        { (**self).store(key, data) }
            fn remove(&self, key: &Key) -> Result<bool>                  { (**self).remove(key) }
            fn num_blocks(&self) -> Result<u64>                          { (**self).num_blocks() }
            fn exists(&self, key: &Key) -> Result<bool>                  { (**self).exists(key) }
            fn resize(&self, key: &Key, new_size: usize) -> Result<()>   { (**self).resize(key, new_size) }
        }
    )*};
}

forward_block_store!(&S, std::sync::Arc<S>, Box<S>);

/// Requires feature: `test-utils`
#[cfg(any(test, feature = "test-utils"))]
pub mod testutils {
    //! Shared contract checks and fault injection for store implementations.
    //!
    //! Enable with the `test-utils` feature flag.

    use std::sync::Mutex;

    use super::*;

    /// Wraps a store and starts failing every mutation once an armed budget
    /// of successful mutations is spent.
    pub struct FailingBlockStore<B: BlockStore> {
        inner:  B,
        budget: Mutex<Option<usize>>,
    }

    impl<B: BlockStore> FailingBlockStore<B> {
        pub fn new(inner: B) -> Self {
            Self { inner, budget: Mutex::new(None) }
        }

        pub fn fail_after(&self, mutations: usize) {
            *self.budget.lock().unwrap() = Some(mutations);
        }

        pub fn disarm(&self) {
            *self.budget.lock().unwrap() = None;
        }

        fn spend(&self) -> Result<()> {
            let mut budget = self.budget.lock().unwrap();
            match budget.as_mut() {
                Some(0) => Err(BlockStoreError::Io(io::Error::new(io::ErrorKind::Other, "injected failure"))),
                Some(remaining) => {
                    *remaining -= 1;
                    Ok(())
                }
                None => Ok(()),
            }
        }
    }

    impl<B: BlockStore> BlockStore for FailingBlockStore<B> {
        fn try_create(&self, key: &Key, data: &[u8]) -> Result<bool> {
            self.spend()?;
            self.inner.try_create(key, data)
        }

        fn load(&self, key: &Key) -> Result<Option<Vec<u8>>> {
            self.inner.load(key)
        }

        fn store(&self, key: &Key, data: &[u8]) -> Result<()> {
            self.spend()?;
            self.inner.store(key, data)
        }

        fn remove(&self, key: &Key) -> Result<bool> {
            self.spend()?;
            self.inner.remove(key)
        }

        fn num_blocks(&self) -> Result<u64> {
            self.inner.num_blocks()
        }
    }

    pub fn check_store_contract<S: BlockStore>(store: &S) {
        let key = Key::random();
        assert!(!store.exists(&key).unwrap());
        assert_eq!(store.load(&key).unwrap(), None);

        assert!(store.try_create(&key, b"first").unwrap());
        assert!(!store.try_create(&key, b"second").unwrap());
        assert_eq!(store.load(&key).unwrap().as_deref(), Some(&b"first"[..]));

        store.store(&key, b"overwritten").unwrap();
        assert_eq!(store.load(&key).unwrap().as_deref(), Some(&b"overwritten"[..]));

        store.resize(&key, 4).unwrap();
        assert_eq!(store.load(&key).unwrap().as_deref(), Some(&b"over"[..]));
        store.resize(&key, 6).unwrap();
        assert_eq!(store.load(&key).unwrap().as_deref(), Some(&b"over\0\0"[..]));

        let created = store.create().unwrap();
        assert_ne!(created, key);
        assert_eq!(store.load(&created).unwrap(), Some(Vec::new()));
        assert_eq!(store.num_blocks().unwrap(), 2);

        assert!(store.remove(&key).unwrap());
        assert!(!store.remove(&key).unwrap());
        assert_eq!(store.num_blocks().unwrap(), 1);

        assert!(matches!(store.resize(&key, 10), Err(BlockStoreError::NotFound(k)) if k == key));
    }
}
