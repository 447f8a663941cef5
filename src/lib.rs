pub mod key;
pub mod crypto;
pub mod blockstore;
pub mod blob;
pub mod fsblob;
pub mod config;

pub use key::{Key, KEY_SIZE};
pub use crypto::EncryptionKey;
pub use blockstore::{BlockStore, BlockStoreError, EncryptedBlockStore, InMemoryBlockStore, OnDiskBlockStore};
pub use blob::{Blob, BlobError, BlobStore};
pub use fsblob::{DirBlob, EntryType, FileBlob, FsBlob, FsBlobError, FsBlobStore, FsBlobView, SymlinkBlob};
pub use config::{BlobStoreConfig, ConfigError};
