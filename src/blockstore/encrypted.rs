//! Encrypting adapter: seals every block before handing it to an inner store.
//!
//! Stored layout (little-endian):
//!
//! ```text
//! [ format version u16 = 1 | nonce (12 B) | ciphertext | GCM tag (16 B) ]
//! ```
//!
//! The block key is authenticated as associated data, so an attacker with
//! write access to the inner store cannot move a valid ciphertext to another
//! key without the load failing with [`BlockStoreError::IntegrityViolation`].

use byteorder::{ByteOrder, LittleEndian};

use super::{BlockStore, BlockStoreError, Result};
use crate::crypto::{self, CryptoError, EncryptionKey};
use crate::key::Key;

pub const ENCRYPTED_FORMAT_VERSION: u16 = 1;
const VERSION_LEN: usize = 2;

pub struct EncryptedBlockStore<B: BlockStore> {
    inner: B,
    key:   EncryptionKey,
}

impl<B: BlockStore> EncryptedBlockStore<B> {
    pub fn new(inner: B, key: EncryptionKey) -> Self {
        Self { inner, key }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    fn seal(&self, key: &Key, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = crypto::encrypt(&self.key, plaintext, key.as_bytes())?;
        let mut out = vec![0u8; VERSION_LEN];
        LittleEndian::write_u16(&mut out, ENCRYPTED_FORMAT_VERSION);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open(&self, key: &Key, stored: &[u8]) -> Result<Vec<u8>> {
        if stored.len() < VERSION_LEN {
            return Err(BlockStoreError::Corrupted {
                key:    *key,
                reason: "missing format version".to_string(),
            });
        }
        let version = LittleEndian::read_u16(&stored[..VERSION_LEN]);
        if version != ENCRYPTED_FORMAT_VERSION {
            return Err(BlockStoreError::UnsupportedFormat { key: *key, version });
        }
        match crypto::decrypt(&self.key, &stored[VERSION_LEN..], key.as_bytes()) {
            Ok(plaintext) => Ok(plaintext),
            Err(CryptoError::DecryptionFailed) => Err(BlockStoreError::IntegrityViolation(*key)),
            Err(e) => Err(BlockStoreError::Corrupted { key: *key, reason: e.to_string() }),
        }
    }
}

impl<B: BlockStore> BlockStore for EncryptedBlockStore<B> {
    fn try_create(&self, key: &Key, data: &[u8]) -> Result<bool> {
        let sealed = self.seal(key, data)?;
        self.inner.try_create(key, &sealed)
    }

    fn load(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        match self.inner.load(key)? {
            Some(stored) => self.open(key, &stored).map(Some),
            None => Ok(None),
        }
    }

    fn store(&self, key: &Key, data: &[u8]) -> Result<()> {
        let sealed = self.seal(key, data)?;
        self.inner.store(key, &sealed)
    }

    fn remove(&self, key: &Key) -> Result<bool> {
        self.inner.remove(key)
    }

    fn num_blocks(&self) -> Result<u64> {
        self.inner.num_blocks()
    }

    fn exists(&self, key: &Key) -> Result<bool> {
        self.inner.exists(key)
    }
}
