//! Block-tree algorithms behind [`Blob`](super::Blob).
//!
//! The tree is left-packed: all leaves sit at depth 0, every leaf except the
//! last is full, and every inner node off the rightmost path is full.  That
//! makes leaf `i` addressable by plain division and lets the blob size be
//! computed from the rightmost path alone.
//!
//! The root block never moves.  Growing past the capacity of the current
//! depth copies the root into a fresh child and turns the root into an inner
//! node above it; shrinking collapses single-child roots the other way.

use std::cmp::min;

use super::node::{DataNode, NodeLayout};
use super::{BlobError, Result};
use crate::blockstore::BlockStore;
use crate::key::Key;

/// Rightmost-path summary of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeShape {
    pub depth:         u8,
    pub num_leaves:    u64,
    pub last_leaf_len: usize,
}

impl TreeShape {
    /// `None` if the shape describes more bytes than a `u64` can count.
    pub fn size(&self, layout: &NodeLayout) -> Option<u64> {
        (self.num_leaves - 1)
            .checked_mul(layout.max_bytes_per_leaf() as u64)?
            .checked_add(self.last_leaf_len as u64)
    }
}

pub(crate) struct DataTree<'a, B: BlockStore> {
    store:  &'a B,
    layout: NodeLayout,
    root:   Key,
}

impl<'a, B: BlockStore> DataTree<'a, B> {
    pub fn new(store: &'a B, layout: NodeLayout, root: Key) -> Self {
        Self { store, layout, root }
    }

    // ── Node I/O ─────────────────────────────────────────────────────────────

    fn load_node(&self, key: &Key) -> Result<DataNode> {
        let bytes = self.store.load(key)?.ok_or(BlobError::MissingNode(*key))?;
        DataNode::decode(key, &bytes, &self.layout)
    }

    fn load_at_depth(&self, key: &Key, depth: u8) -> Result<DataNode> {
        let node = self.load_node(key)?;
        if node.depth() != depth {
            return Err(BlobError::CorruptNode {
                key:    *key,
                reason: format!("expected depth {depth}, found {}", node.depth()),
            });
        }
        Ok(node)
    }

    fn store_node(&self, key: &Key, node: &DataNode) -> Result<()> {
        self.store.store(key, &node.encode())?;
        Ok(())
    }

    fn create_node(&self, node: &DataNode) -> Result<Key> {
        Ok(self.store.create_with(&node.encode())?)
    }

    fn max_leaf(&self) -> u64 {
        self.layout.max_bytes_per_leaf() as u64
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn shape(&self) -> Result<TreeShape> {
        let mut node = self.load_node(&self.root)?;
        let depth = node.depth();
        let mut leaves_before = 0u64;
        loop {
            match node {
                DataNode::Leaf(data) => {
                    return Ok(TreeShape {
                        depth,
                        num_leaves:    leaves_before.checked_add(1).ok_or_else(|| self.too_large())?,
                        last_leaf_len: data.len(),
                    });
                }
                DataNode::Inner { depth: d, children } => {
                    let per_child = self.layout.leaves_per_subtree(d - 1);
                    leaves_before = (children.len() as u64 - 1)
                        .checked_mul(per_child)
                        .and_then(|n| n.checked_add(leaves_before))
                        .ok_or_else(|| self.too_large())?;
                    // decode() guarantees inner nodes have at least one child
                    let last = children[children.len() - 1];
                    node = self.load_at_depth(&last, d - 1)?;
                }
            }
        }
    }

    pub fn size(&self) -> Result<u64> {
        self.shape()?.size(&self.layout).ok_or_else(|| self.too_large())
    }

    fn too_large(&self) -> BlobError {
        BlobError::CorruptNode { key: self.root, reason: "tree describes more bytes than fit in a u64".to_string() }
    }

    /// Walk from the root to leaf number `index`.
    fn find_leaf(&self, mut index: u64) -> Result<(Key, Vec<u8>)> {
        let mut key = self.root;
        let mut node = self.load_node(&key)?;
        loop {
            match node {
                DataNode::Leaf(data) => return Ok((key, data)),
                DataNode::Inner { depth, children } => {
                    let per_child = self.layout.leaves_per_subtree(depth - 1);
                    let slot = (index / per_child) as usize;
                    index %= per_child;
                    let child = *children.get(slot).ok_or_else(|| BlobError::CorruptNode {
                        key,
                        reason: format!("no child at slot {slot}"),
                    })?;
                    node = self.load_at_depth(&child, depth - 1)?;
                    key = child;
                }
            }
        }
    }

    pub fn num_nodes(&self) -> Result<u64> {
        let root = self.load_node(&self.root)?;
        self.count_nodes(&root)
    }

    fn count_nodes(&self, node: &DataNode) -> Result<u64> {
        match node {
            DataNode::Leaf(_) => Ok(1),
            DataNode::Inner { depth: 1, children } => Ok(1 + children.len() as u64),
            DataNode::Inner { depth, children } => {
                let mut total = 1;
                for child in children {
                    total += self.count_nodes(&self.load_at_depth(child, depth - 1)?)?;
                }
                Ok(total)
            }
        }
    }

    // ── Data access (ranges are validated by the caller) ────────────────────

    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let max_leaf = self.max_leaf();
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let in_leaf = (pos % max_leaf) as usize;
            let n = min(buf.len() - done, max_leaf as usize - in_leaf);
            let (key, data) = self.find_leaf(pos / max_leaf)?;
            let chunk = data.get(in_leaf..in_leaf + n).ok_or_else(|| short_leaf(key))?;
            buf[done..done + n].copy_from_slice(chunk);
            done += n;
        }
        Ok(())
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let max_leaf = self.max_leaf();
        let mut done = 0usize;
        while done < bytes.len() {
            let pos = offset + done as u64;
            let in_leaf = (pos % max_leaf) as usize;
            let n = min(bytes.len() - done, max_leaf as usize - in_leaf);
            let (key, mut data) = self.find_leaf(pos / max_leaf)?;
            data.get_mut(in_leaf..in_leaf + n)
                .ok_or_else(|| short_leaf(key))?
                .copy_from_slice(&bytes[done..done + n]);
            self.store_node(&key, &DataNode::Leaf(data))?;
            done += n;
        }
        Ok(())
    }

    // ── Resize ───────────────────────────────────────────────────────────────

    pub fn resize(&self, new_size: u64) -> Result<()> {
        let shape = self.shape()?;
        let max_leaf = self.max_leaf();
        let num_leaves = new_size.div_ceil(max_leaf).max(1);
        let last_leaf_len = (new_size - (num_leaves - 1) * max_leaf) as usize;

        let mut target_depth = shape.depth;
        while self.layout.leaves_per_subtree(target_depth) < num_leaves {
            if target_depth >= self.layout.max_depth() {
                return Err(BlobError::OutOfRange { offset: 0, len: new_size, size: shape.size(&self.layout).unwrap_or(0) });
            }
            target_depth += 1;
        }

        let mut depth = shape.depth;
        while depth < target_depth {
            self.add_level(depth)?;
            depth += 1;
        }
        self.reshape(&self.root, depth, num_leaves, last_leaf_len)?;
        if num_leaves < shape.num_leaves {
            self.collapse_root()?;
        }
        Ok(())
    }

    /// Make the subtree at `key` hold exactly `num_leaves` leaves, all full
    /// except the last, which gets `last_leaf_len` bytes.  Surviving bytes are
    /// kept, new bytes are zero.
    fn reshape(&self, key: &Key, depth: u8, num_leaves: u64, last_leaf_len: usize) -> Result<()> {
        let children = match self.load_at_depth(key, depth)? {
            DataNode::Leaf(mut data) => {
                if data.len() != last_leaf_len {
                    data.resize(last_leaf_len, 0);
                    self.store_node(key, &DataNode::Leaf(data))?;
                }
                return Ok(());
            }
            DataNode::Inner { children, .. } => children,
        };

        let per_child = self.layout.leaves_per_subtree(depth - 1);
        let new_count = num_leaves.div_ceil(per_child) as usize;
        let old_count = children.len();
        let kept = min(new_count, old_count);

        let mut new_children = children[..kept].to_vec();
        let dropped = &children[kept..];

        // Children left of the old last child are full and stay full.
        for i in (kept - 1)..new_count {
            let (child_leaves, child_last_len) = if i == new_count - 1 {
                (num_leaves - (new_count as u64 - 1) * per_child, last_leaf_len)
            } else {
                (per_child, self.layout.max_bytes_per_leaf())
            };
            if i < kept {
                self.reshape(&new_children[i], depth - 1, child_leaves, child_last_len)?;
            } else {
                new_children.push(self.create_subtree(depth - 1, child_leaves, child_last_len)?);
            }
        }

        if new_count != old_count {
            self.store_node(key, &DataNode::Inner { depth, children: new_children })?;
        }
        // Only release blocks once nothing references them any more.
        for child in dropped {
            self.remove_subtree(child, depth - 1)?;
        }
        Ok(())
    }

    fn create_subtree(&self, depth: u8, num_leaves: u64, last_leaf_len: usize) -> Result<Key> {
        if depth == 0 {
            return self.create_node(&DataNode::Leaf(vec![0u8; last_leaf_len]));
        }
        let per_child = self.layout.leaves_per_subtree(depth - 1);
        let count = num_leaves.div_ceil(per_child) as usize;
        let mut children = Vec::with_capacity(count);
        for i in 0..count {
            let child = if i == count - 1 {
                self.create_subtree(depth - 1, num_leaves - (count as u64 - 1) * per_child, last_leaf_len)?
            } else {
                self.create_subtree(depth - 1, per_child, self.layout.max_bytes_per_leaf())?
            };
            children.push(child);
        }
        self.create_node(&DataNode::Inner { depth, children })
    }

    /// Push the current root content one level down.
    fn add_level(&self, depth: u8) -> Result<()> {
        let root = self.load_at_depth(&self.root, depth)?;
        let moved = self.create_node(&root)?;
        self.store_node(&self.root, &DataNode::Inner { depth: depth + 1, children: vec![moved] })
    }

    /// Pull single children up into the root until the root fans out (or is
    /// a leaf).
    fn collapse_root(&self) -> Result<()> {
        loop {
            match self.load_node(&self.root)? {
                DataNode::Inner { depth, children } if children.len() == 1 => {
                    let child = children[0];
                    let child_node = self.load_at_depth(&child, depth - 1)?;
                    self.store_node(&self.root, &child_node)?;
                    self.store.remove(&child)?;
                }
                _ => return Ok(()),
            }
        }
    }

    // ── Removal ──────────────────────────────────────────────────────────────

    pub fn remove_all(&self) -> Result<()> {
        let depth = self.load_node(&self.root)?.depth();
        self.remove_subtree(&self.root, depth)
    }

    fn remove_subtree(&self, key: &Key, depth: u8) -> Result<()> {
        if depth > 0 {
            if let DataNode::Inner { children, .. } = self.load_at_depth(key, depth)? {
                for child in &children {
                    self.remove_subtree(child, depth - 1)?;
                }
            }
        }
        self.store.remove(key)?;
        Ok(())
    }
}

fn short_leaf(key: Key) -> BlobError {
    BlobError::CorruptNode { key, reason: "leaf is shorter than the tree size implies".to_string() }
}
