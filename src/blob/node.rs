//! On-disk node format of the blob data tree.
//!
//! Every block the blob layer writes is one node:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 2 | node format version (`NODE_FORMAT_VERSION`) |
//! | 2 | 1 | reserved, always 0 |
//! | 3 | 1 | depth (0 = leaf) |
//! | 4 | 4 | leaf: data length / inner: child count |
//! | 8 | ... | leaf: data / inner: child keys, 16 B each |
//!
//! All integers are little-endian.  Leaves are stored unpadded, so a block
//! is exactly as long as the node it holds.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{BlobError, Result};
use crate::key::{Key, KEY_SIZE};

pub const NODE_FORMAT_VERSION: u16 = 0;
pub const NODE_HEADER_SIZE: usize = 8;
/// Smallest block that still fits a node header and two child keys.
pub const MIN_BLOCK_SIZE: usize = NODE_HEADER_SIZE + 2 * KEY_SIZE;

/// Derived capacities for a given block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    block_size: usize,
}

impl NodeLayout {
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE || block_size - NODE_HEADER_SIZE > u32::MAX as usize {
            return Err(BlobError::InvalidBlockSize(block_size));
        }
        Ok(Self { block_size })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn max_bytes_per_leaf(&self) -> usize {
        self.block_size - NODE_HEADER_SIZE
    }

    #[inline]
    pub fn max_children_per_inner(&self) -> usize {
        (self.block_size - NODE_HEADER_SIZE) / KEY_SIZE
    }

    /// Number of leaves a full subtree rooted at `depth` holds.
    pub fn leaves_per_subtree(&self, depth: u8) -> u64 {
        (self.max_children_per_inner() as u64)
            .checked_pow(u32::from(depth))
            .unwrap_or(u64::MAX)
    }

    /// Deepest tree whose byte capacity still fits in a `u64`.
    pub fn max_depth(&self) -> u8 {
        let fanout = self.max_children_per_inner() as u64;
        let max_leaf = self.max_bytes_per_leaf() as u64;
        let mut depth = 0u8;
        let mut leaves = 1u64;
        while let Some(next) = leaves.checked_mul(fanout) {
            if next.checked_mul(max_leaf).is_none() {
                break;
            }
            leaves = next;
            depth += 1;
        }
        depth
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataNode {
    Leaf(Vec<u8>),
    Inner { depth: u8, children: Vec<Key> },
}

impl DataNode {
    pub fn depth(&self) -> u8 {
        match self {
            DataNode::Leaf(_) => 0,
            DataNode::Inner { depth, .. } => *depth,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len = match self {
            DataNode::Leaf(data) => data.len(),
            DataNode::Inner { children, .. } => children.len() * KEY_SIZE,
        };
        let mut out = Vec::with_capacity(NODE_HEADER_SIZE + body_len);
        // Writing into a Vec cannot fail.
        let _ = self.write(&mut out);
        out
    }

    fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(NODE_FORMAT_VERSION)?;
        writer.write_u8(0)?;
        writer.write_u8(self.depth())?;
        match self {
            DataNode::Leaf(data) => {
                writer.write_u32::<LittleEndian>(data.len() as u32)?;
                writer.write_all(data)?;
            }
            DataNode::Inner { children, .. } => {
                writer.write_u32::<LittleEndian>(children.len() as u32)?;
                for child in children {
                    writer.write_all(child.as_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Parse and validate the node stored under `key`.
    pub fn decode(key: &Key, bytes: &[u8], layout: &NodeLayout) -> Result<Self> {
        let corrupt = |reason: String| BlobError::CorruptNode { key: *key, reason };

        if bytes.len() < NODE_HEADER_SIZE {
            return Err(corrupt(format!("node is only {} bytes", bytes.len())));
        }
        let mut reader = Cursor::new(bytes);
        let version = reader.read_u16::<LittleEndian>().map_err(|e| corrupt(e.to_string()))?;
        if version != NODE_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported node format version {version}")));
        }
        let _reserved = reader.read_u8().map_err(|e| corrupt(e.to_string()))?;
        let depth = reader.read_u8().map_err(|e| corrupt(e.to_string()))?;
        let size = reader.read_u32::<LittleEndian>().map_err(|e| corrupt(e.to_string()))? as usize;
        let body = &bytes[NODE_HEADER_SIZE..];

        if depth > layout.max_depth() {
            return Err(corrupt(format!("depth {depth} exceeds the maximum of {}", layout.max_depth())));
        }

        if depth == 0 {
            if size > layout.max_bytes_per_leaf() {
                return Err(corrupt(format!("leaf claims {size} bytes, capacity is {}", layout.max_bytes_per_leaf())));
            }
            if body.len() != size {
                return Err(corrupt(format!("leaf claims {size} bytes but holds {}", body.len())));
            }
            return Ok(DataNode::Leaf(body.to_vec()));
        }

        if size == 0 || size > layout.max_children_per_inner() {
            return Err(corrupt(format!("inner node has invalid child count {size}")));
        }
        if body.len() != size * KEY_SIZE {
            return Err(corrupt(format!("inner node claims {size} children but holds {} bytes", body.len())));
        }
        let mut children = Vec::with_capacity(size);
        for _ in 0..size {
            let mut child = [0u8; KEY_SIZE];
            reader.read_exact(&mut child).map_err(|e| corrupt(e.to_string()))?;
            children.push(Key::from_bytes(child));
        }
        Ok(DataNode::Inner { depth, children })
    }
}
