//! Single-owner bookkeeping for blobs handed out by one `FsBlobStore`.
//!
//! Every `FsBlob` obtained through the store holds a [`BlobLease`] on its
//! key.  While the lease lives, loading or creating the same key again fails
//! with [`FsBlobError::AlreadyOpen`], so no two handles cache diverging
//! images of one blob.  Dropping the handle releases the key.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{FsBlobError, Result};
use crate::key::Key;

#[derive(Debug, Default)]
pub(crate) struct OpenBlobs {
    keys: Mutex<HashSet<Key>>,
}

impl OpenBlobs {
    fn keys(&self) -> MutexGuard<'_, HashSet<Key>> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn acquire(self: &Arc<Self>, key: &Key) -> Result<BlobLease> {
        if !self.keys().insert(*key) {
            return Err(FsBlobError::AlreadyOpen(*key));
        }
        Ok(BlobLease { key: *key, open: Arc::clone(self) })
    }

    pub fn is_open(&self, key: &Key) -> bool {
        self.keys().contains(key)
    }
}

#[derive(Debug)]
pub(crate) struct BlobLease {
    key:  Key,
    open: Arc<OpenBlobs>,
}

impl Drop for BlobLease {
    fn drop(&mut self) {
        self.open.keys().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let open = Arc::new(OpenBlobs::default());
        let key = Key::random();
        let lease = open.acquire(&key).unwrap();
        assert!(open.is_open(&key));
        assert!(matches!(open.acquire(&key), Err(FsBlobError::AlreadyOpen(k)) if k == key));
        assert!(open.acquire(&Key::random()).is_ok());

        drop(lease);
        assert!(!open.is_open(&key));
        assert!(open.acquire(&key).is_ok());
    }
}
