//! Header-aware access to a raw [`Blob`].

use byteorder::{ByteOrder, LittleEndian};

use super::layout::{
    EntryType, FsBlobHeader, HeaderLayout, ENTRY_TYPE_OFFSET, FORMAT_VERSION_HEADER,
    FORMAT_VERSION_SIZE, HEADER_SIZE, LEGACY_FORMAT_VERSION, OLD_HEADER_SIZE, PARENT_OFFSET,
};
use super::lease::BlobLease;
use super::{FsBlobError, Result};
use crate::blob::{self, Blob, BlobError};
use crate::blockstore::BlockStore;
use crate::key::{Key, KEY_SIZE};

const BODY_OFFSET: u64 = HEADER_SIZE as u64;

/// Read the format version tag of any blob, legacy or current.
pub fn get_format_version_header<S: BlockStore>(blob: &Blob<S>) -> Result<u16> {
    let size = blob.size()?;
    if size < FORMAT_VERSION_SIZE as u64 {
        return Err(FsBlobError::TooShort { key: *blob.key(), size });
    }
    let mut bytes = [0u8; FORMAT_VERSION_SIZE];
    blob.read_into(0, &mut bytes)?;
    Ok(LittleEndian::read_u16(&bytes))
}

pub fn set_format_version_header<S: BlockStore>(blob: &mut Blob<S>) -> Result<()> {
    write_format_version(blob, FORMAT_VERSION_HEADER)?;
    Ok(())
}

fn write_format_version<S: BlockStore>(blob: &mut Blob<S>, version: u16) -> blob::Result<()> {
    let mut bytes = [0u8; FORMAT_VERSION_SIZE];
    LittleEndian::write_u16(&mut bytes, version);
    blob.write(0, &bytes)
}

/// Upgrade a legacy blob to the current header, recording `parent`.
///
/// All writes land in one blob transaction.  If anything fails, the blob is
/// still a byte-identical legacy blob and `migrate` can simply be retried.
///
/// # Panics
///
/// If the blob is not in the legacy format.
pub fn migrate<B: BlockStore>(blob: &mut Blob<B>, parent: &Key) -> Result<()> {
    let version = get_format_version_header(blob)?;
    assert_eq!(
        version, LEGACY_FORMAT_VERSION,
        "migrate called on blob {} which is not in the legacy header format",
        blob.key()
    );
    let size = blob.size()?;
    if size < OLD_HEADER_SIZE as u64 {
        return Err(FsBlobError::TooShort { key: *blob.key(), size });
    }

    blob.transaction(|staged| migrate_steps(staged, parent))?;
    tracing::debug!(blob = %blob.key(), parent = %parent, "migrated blob header");
    Ok(())
}

// Runs on the staged blob; the version tag is written last.
fn migrate_steps<S: BlockStore>(blob: &mut Blob<S>, parent: &Key) -> blob::Result<()> {
    let data = blob.read_all()?;
    blob.resize(data.len() as u64 + KEY_SIZE as u64)?;
    blob.write(BODY_OFFSET, &data[OLD_HEADER_SIZE..])?;
    blob.write(PARENT_OFFSET as u64, parent.as_bytes())?;
    write_format_version(blob, FORMAT_VERSION_HEADER)
}

fn replace_body_steps<S: BlockStore>(blob: &mut Blob<S>, body: &[u8]) -> blob::Result<()> {
    blob.resize(BODY_OFFSET + body.len() as u64)?;
    blob.write(BODY_OFFSET, body)
}

fn body_pos(offset: u64) -> blob::Result<u64> {
    offset
        .checked_add(BODY_OFFSET)
        .ok_or(BlobError::OutOfRange { offset, len: 0, size: u64::MAX - BODY_OFFSET })
}

// ── FsBlobView ───────────────────────────────────────────────────────────────

/// A blob confirmed to carry a current-layout header.  Body offsets are
/// relative to the end of the header.
pub struct FsBlobView<B: BlockStore> {
    blob:   Blob<B>,
    // Held for as long as the view lives when handed out by a store.
    _lease: Option<BlobLease>,
}

impl<B: BlockStore> FsBlobView<B> {
    /// Wrap a blob whose header is already current.
    ///
    /// # Panics
    ///
    /// If the blob still has a legacy header; [`migrate`] it first.
    pub fn new(blob: Blob<B>) -> Result<Self> {
        let version = get_format_version_header(&blob)?;
        assert_ne!(
            version, LEGACY_FORMAT_VERSION,
            "blob {} must be migrated before its header can be read",
            blob.key()
        );
        let layout = HeaderLayout::from_format_version(version)?;
        let size = blob.size()?;
        if size < layout.header_size() as u64 {
            return Err(FsBlobError::TooShort { key: *blob.key(), size });
        }
        Ok(Self { blob, _lease: None })
    }

    /// Write a fresh header into an empty blob.
    pub fn create(mut blob: Blob<B>, entry_type: EntryType, parent: &Key) -> Result<Self> {
        blob.resize(HEADER_SIZE as u64)?;
        blob.write(0, &FsBlobHeader::new(entry_type, *parent).encode())?;
        Ok(Self { blob, _lease: None })
    }

    pub(crate) fn with_lease(mut self, lease: BlobLease) -> Self {
        self._lease = Some(lease);
        self
    }

    pub fn key(&self) -> &Key {
        self.blob.key()
    }

    pub fn blob(&self) -> &Blob<B> {
        &self.blob
    }

    pub fn into_blob(self) -> Blob<B> {
        self.blob
    }

    pub fn header(&self) -> Result<FsBlobHeader> {
        let bytes = self.blob.read(0, HEADER_SIZE)?;
        FsBlobHeader::read(&bytes[..])
    }

    pub fn entry_type(&self) -> Result<EntryType> {
        let mut byte = [0u8; 1];
        self.blob.read_into(ENTRY_TYPE_OFFSET as u64, &mut byte)?;
        EntryType::from_byte(byte[0])
    }

    pub fn parent(&self) -> Result<Key> {
        let mut bytes = [0u8; KEY_SIZE];
        self.blob.read_into(PARENT_OFFSET as u64, &mut bytes)?;
        Ok(Key::from_bytes(bytes))
    }

    pub fn set_parent(&mut self, parent: &Key) -> Result<()> {
        self.blob.write(PARENT_OFFSET as u64, parent.as_bytes())?;
        Ok(())
    }

    // ── Body ─────────────────────────────────────────────────────────────────

    pub fn body_size(&self) -> Result<u64> {
        Ok(self.blob.size()?.saturating_sub(BODY_OFFSET))
    }

    pub fn read_body(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        Ok(self.blob.read(body_pos(offset)?, len)?)
    }

    pub fn read_body_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.blob.read_into(body_pos(offset)?, buf)?;
        Ok(())
    }

    /// Read up to `buf.len()` body bytes, stopping at the end of the blob.
    pub fn try_read_body(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(self.blob.try_read(body_pos(offset)?, buf)?)
    }

    pub fn write_body(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.blob.write(body_pos(offset)?, data)?;
        Ok(())
    }

    pub fn resize_body(&mut self, size: u64) -> Result<()> {
        self.blob.resize(body_pos(size)?)?;
        Ok(())
    }

    pub fn read_all_body(&self) -> Result<Vec<u8>> {
        let len = self.body_size()?;
        let len = usize::try_from(len).map_err(|_| BlobError::OutOfRange { offset: 0, len, size: len })?;
        self.read_body(0, len)
    }

    /// Replace the whole body in a single blob transaction.
    pub fn replace_body(&mut self, body: &[u8]) -> Result<()> {
        self.blob.transaction(|staged| replace_body_steps(staged, body))?;
        Ok(())
    }

    pub fn remove(self) -> Result<()> {
        self.blob.remove()?;
        Ok(())
    }
}
