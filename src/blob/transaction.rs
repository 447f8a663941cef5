//! Blob transactions: buffered multi-step updates with a single commit point.
//!
//! A transaction runs a blob operation against a [`StagedBlockStore`], which
//! keeps every write in memory on top of the real store.  Committing uses
//! shadow paging:
//!
//! 1. Blocks created inside the transaction are written under their own
//!    (fresh, unreferenced) keys.
//! 2. Modified pre-existing non-root blocks are written to *new* keys, and
//!    their parents are rewritten to point at the copies.
//! 3. The root block is overwritten in place.  This single-block write is the
//!    commit point; before it the old tree is untouched and fully readable.
//! 4. Blocks the new tree no longer references are removed.
//!
//! A failure before step 3 leaves the blob byte-identical to its state before
//! the transaction.  A failure in step 4 only leaves orphaned blocks.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::node::{DataNode, NodeLayout};
use super::{BlobError, Result};
use crate::blockstore::{self, BlockStore};
use crate::key::Key;

#[derive(Debug, Default)]
struct StagingState {
    /// `None` marks a removed block.
    writes:  HashMap<Key, Option<Vec<u8>>>,
    created: HashSet<Key>,
    /// Every key read or written through the staging store.
    touched: HashSet<Key>,
}

/// Write-buffering overlay over another block store.
pub struct StagedBlockStore<B: BlockStore> {
    base:  B,
    state: Mutex<StagingState>,
}

impl<B: BlockStore> StagedBlockStore<B> {
    pub fn new(base: B) -> Self {
        Self { base, state: Mutex::new(StagingState::default()) }
    }

    fn state(&self) -> MutexGuard<'_, StagingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of blocks written, created or removed so far.
    pub fn pending_writes(&self) -> usize {
        self.state().writes.len()
    }

    /// Publish the staged changes of the tree rooted at `root`.
    ///
    /// Consumes the staged state; a second call is a no-op.
    pub fn commit(&self, root: &Key, layout: NodeLayout) -> Result<()> {
        let state = std::mem::take(&mut *self.state());
        if state.writes.is_empty() {
            return Ok(());
        }

        let mut committer = Committer {
            base:    &self.base,
            state:   &state,
            layout,
            fresh:   Vec::new(),
            retired: Vec::new(),
        };

        if let Err(e) = committer.publish_root(root) {
            committer.discard_fresh();
            return Err(e);
        }

        let mut orphans = committer.retired;
        orphans.extend(
            state.writes.iter()
                .filter(|(key, data)| data.is_none() && !state.created.contains(*key))
                .map(|(key, _)| *key),
        );
        for key in orphans {
            if let Err(e) = self.base.remove(&key) {
                tracing::warn!(block = %key, error = %e, "could not remove retired block, leaving it orphaned");
            }
        }
        tracing::debug!(blob = %root, "committed blob transaction");
        Ok(())
    }
}

impl<B: BlockStore> BlockStore for StagedBlockStore<B> {
    fn try_create(&self, key: &Key, data: &[u8]) -> blockstore::Result<bool> {
        let mut state = self.state();
        let exists = match state.writes.get(key) {
            Some(staged) => staged.is_some(),
            None => self.base.exists(key)?,
        };
        if exists {
            return Ok(false);
        }
        state.writes.insert(*key, Some(data.to_vec()));
        state.created.insert(*key);
        state.touched.insert(*key);
        Ok(true)
    }

    fn load(&self, key: &Key) -> blockstore::Result<Option<Vec<u8>>> {
        let mut state = self.state();
        state.touched.insert(*key);
        match state.writes.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.load(key),
        }
    }

    fn store(&self, key: &Key, data: &[u8]) -> blockstore::Result<()> {
        let mut state = self.state();
        state.writes.insert(*key, Some(data.to_vec()));
        state.touched.insert(*key);
        Ok(())
    }

    fn remove(&self, key: &Key) -> blockstore::Result<bool> {
        let mut state = self.state();
        let existed = match state.writes.get(key) {
            Some(staged) => staged.is_some(),
            None => self.base.exists(key)?,
        };
        if state.created.remove(key) {
            state.writes.remove(key);
        } else if existed {
            state.writes.insert(*key, None);
        }
        Ok(existed)
    }

    fn num_blocks(&self) -> blockstore::Result<u64> {
        let state = self.state();
        let removed = state.writes.iter()
            .filter(|(key, data)| data.is_none() && !state.created.contains(*key))
            .count() as u64;
        Ok(self.base.num_blocks()? + state.created.len() as u64 - removed)
    }

    fn exists(&self, key: &Key) -> blockstore::Result<bool> {
        match self.state().writes.get(key) {
            Some(staged) => Ok(staged.is_some()),
            None => self.base.exists(key),
        }
    }
}

struct Committer<'a, B: BlockStore> {
    base:    &'a B,
    state:   &'a StagingState,
    layout:  NodeLayout,
    /// Blocks written to the base store ahead of the root.
    fresh:   Vec<Key>,
    /// Pre-existing blocks superseded by relocated copies.
    retired: Vec<Key>,
}

impl<'a, B: BlockStore> Committer<'a, B> {
    fn current_node(&self, key: &Key) -> Result<DataNode> {
        let bytes = match self.state.writes.get(key) {
            Some(Some(staged)) => staged.clone(),
            Some(None) => {
                return Err(BlobError::CorruptNode {
                    key:    *key,
                    reason: "transaction removed a block that is still referenced".to_string(),
                })
            }
            None => self.base.load(key)?.ok_or(BlobError::MissingNode(*key))?,
        };
        DataNode::decode(key, &bytes, &self.layout)
    }

    /// Flush the children of `node`, returning whether any child moved.
    fn flush_children(&mut self, node: &mut DataNode) -> Result<bool> {
        let mut moved = false;
        if let DataNode::Inner { children, .. } = node {
            for child in children.iter_mut() {
                let new_key = self.flush_subtree(child)?;
                if new_key != *child {
                    *child = new_key;
                    moved = true;
                }
            }
        }
        Ok(moved)
    }

    /// Write out a non-root subtree and return the key it now lives under.
    fn flush_subtree(&mut self, key: &Key) -> Result<Key> {
        // Every modified block was reached through its ancestors, so an
        // untouched block heads an untouched subtree.
        if !self.state.touched.contains(key) {
            return Ok(*key);
        }
        let mut node = self.current_node(key)?;
        let moved = self.flush_children(&mut node)?;
        if !moved && !self.state.writes.contains_key(key) {
            return Ok(*key);
        }

        let bytes = node.encode();
        if self.state.created.contains(key) {
            self.base.store(key, &bytes)?;
            self.fresh.push(*key);
            Ok(*key)
        } else {
            let relocated = self.base.create_with(&bytes)?;
            self.fresh.push(relocated);
            self.retired.push(*key);
            Ok(relocated)
        }
    }

    fn publish_root(&mut self, root: &Key) -> Result<()> {
        let mut node = self.current_node(root)?;
        let moved = self.flush_children(&mut node)?;
        if moved || self.state.writes.contains_key(root) {
            self.base.store(root, &node.encode())?;
        }
        Ok(())
    }

    fn discard_fresh(&self) {
        for key in &self.fresh {
            if let Err(e) = self.base.remove(key) {
                tracing::warn!(block = %key, error = %e, "could not discard uncommitted block");
            }
        }
    }
}
