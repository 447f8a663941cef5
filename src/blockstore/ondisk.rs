//! Directory-backed block store: one file per block.
//!
//! # Layout
//! Block `k` lives at `<root>/<hex(k)[0..3]>/<hex(k)[3..]>`, spreading blocks
//! over up to 4096 subdirectories.
//!
//! Every block file starts with a 10-byte little-endian header:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | magic `0x424C4B31` |
//! | 4 | 2 | format version (1) |
//! | 6 | 4 | CRC32 of the payload |
//! | 10 | ... | payload |
//!
//! # Atomicity
//! Blocks are written to a sibling `.tmp` file, synced, then renamed over the
//! target, so a reader sees either the old or the new block, never a torn one.

use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use super::{BlockStore, BlockStoreError, Result};
use crate::key::Key;

pub const BLOCK_FILE_MAGIC: u32 = 0x424C_4B31;
pub const BLOCK_FILE_VERSION: u16 = 1;
pub const BLOCK_FILE_HEADER_SIZE: usize = 10;

const PREFIX_LEN: usize = 3;
const TEMP_SUFFIX: &str = "tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockFileHeader {
    magic:    u32,
    version:  u16,
    checksum: u32,
}

impl BlockFileHeader {
    fn for_payload(payload: &[u8]) -> Self {
        Self {
            magic:    BLOCK_FILE_MAGIC,
            version:  BLOCK_FILE_VERSION,
            checksum: crc32(payload),
        }
    }

    fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u16::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.checksum)?;
        Ok(())
    }

    fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(Self {
            magic:    reader.read_u32::<LittleEndian>()?,
            version:  reader.read_u16::<LittleEndian>()?,
            checksum: reader.read_u32::<LittleEndian>()?,
        })
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[derive(Debug)]
pub struct OnDiskBlockStore {
    root: PathBuf,
    // Serializes writers so try_create's check-then-write is atomic.
    write_lock: Mutex<()>,
}

impl OnDiskBlockStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        tracing::info!(path = %root.display(), "opened on-disk block store");
        Ok(Self { root, write_lock: Mutex::new(()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_path(&self, key: &Key) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[..PREFIX_LEN]).join(&hex[PREFIX_LEN..])
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_block_file(&self, key: &Key, payload: &[u8]) -> Result<()> {
        let path = self.block_path(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut bytes = Vec::with_capacity(BLOCK_FILE_HEADER_SIZE + payload.len());
        BlockFileHeader::for_payload(payload).write(&mut bytes)?;
        bytes.extend_from_slice(payload);

        let temp_path = path.with_extension(TEMP_SUFFIX);
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn decode_block_file(key: &Key, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() < BLOCK_FILE_HEADER_SIZE {
            return Err(BlockStoreError::Corrupted {
                key:    *key,
                reason: format!("block file is only {} bytes", bytes.len()),
            });
        }
        let header = BlockFileHeader::read(Cursor::new(&bytes[..BLOCK_FILE_HEADER_SIZE]))?;
        if header.magic != BLOCK_FILE_MAGIC {
            return Err(BlockStoreError::Corrupted {
                key:    *key,
                reason: format!("bad magic {:#010x}", header.magic),
            });
        }
        if header.version != BLOCK_FILE_VERSION {
            return Err(BlockStoreError::UnsupportedFormat { key: *key, version: header.version });
        }
        let payload = &bytes[BLOCK_FILE_HEADER_SIZE..];
        if crc32(payload) != header.checksum {
            return Err(BlockStoreError::Corrupted {
                key:    *key,
                reason: "checksum mismatch".to_string(),
            });
        }
        Ok(payload.to_vec())
    }
}

impl BlockStore for OnDiskBlockStore {
    fn try_create(&self, key: &Key, data: &[u8]) -> Result<bool> {
        let _guard = self.lock();
        if self.block_path(key).exists() {
            return Ok(false);
        }
        self.write_block_file(key, data)?;
        Ok(true)
    }

    fn load(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        match fs::read(self.block_path(key)) {
            Ok(bytes) => Self::decode_block_file(key, &bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, key: &Key, data: &[u8]) -> Result<()> {
        let _guard = self.lock();
        self.write_block_file(key, data)
    }

    fn remove(&self, key: &Key) -> Result<bool> {
        let _guard = self.lock();
        let path = self.block_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        // Drop the prefix directory once it runs empty; failure just means
        // another block still lives there.
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir(dir);
        }
        Ok(true)
    }

    fn num_blocks(&self) -> Result<u64> {
        let mut count = 0u64;
        for prefix_dir in fs::read_dir(&self.root)? {
            let prefix_dir = prefix_dir?;
            if !prefix_dir.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(prefix_dir.path())? {
                let path = entry?.path();
                if path.extension().map_or(true, |ext| ext != TEMP_SUFFIX) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn exists(&self, key: &Key) -> Result<bool> {
        Ok(self.block_path(key).is_file())
    }
}
