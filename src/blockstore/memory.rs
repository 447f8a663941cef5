use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{BlockStore, Result};
use crate::key::Key;

/// Block store held entirely in memory.
///
/// Nothing survives the process.  Used by tests and as the base of throwaway
/// filesystems.
#[derive(Debug, Default)]
pub struct InMemoryBlockStore {
    blocks: Mutex<HashMap<Key, Vec<u8>>>,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blocks(&self) -> MutexGuard<'_, HashMap<Key, Vec<u8>>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.blocks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlockStore for InMemoryBlockStore {
    fn try_create(&self, key: &Key, data: &[u8]) -> Result<bool> {
        let mut blocks = self.blocks();
        if blocks.contains_key(key) {
            return Ok(false);
        }
        blocks.insert(*key, data.to_vec());
        Ok(true)
    }

    fn load(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks().get(key).cloned())
    }

    fn store(&self, key: &Key, data: &[u8]) -> Result<()> {
        self.blocks().insert(*key, data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &Key) -> Result<bool> {
        Ok(self.blocks().remove(key).is_some())
    }

    fn num_blocks(&self) -> Result<u64> {
        Ok(self.blocks().len() as u64)
    }

    fn exists(&self, key: &Key) -> Result<bool> {
        Ok(self.blocks().contains_key(key))
    }
}
