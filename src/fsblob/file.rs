use super::view::FsBlobView;
use super::{FsBlobError, Result};
use crate::blob::BlobError;
use crate::blockstore::BlockStore;
use crate::key::Key;

/// Regular file: the body is the file content.
pub struct FileBlob<B: BlockStore> {
    view: FsBlobView<B>,
}

impl<B: BlockStore> FileBlob<B> {
    pub(crate) fn new(view: FsBlobView<B>) -> Self {
        Self { view }
    }

    pub fn view(&self) -> &FsBlobView<B> {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut FsBlobView<B> {
        &mut self.view
    }

    pub fn key(&self) -> &Key {
        self.view.key()
    }

    pub fn size(&self) -> Result<u64> {
        self.view.body_size()
    }

    /// Read into `buf` starting at `offset`.  Returns fewer bytes than asked
    /// (possibly zero) at end of file.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.view.try_read_body(offset, buf)
    }

    /// Write `data` at `offset`, growing the file if needed.  A gap between
    /// the old end and `offset` reads as zeros.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset.checked_add(data.len() as u64).ok_or(FsBlobError::Blob(BlobError::OutOfRange {
            offset,
            len:  data.len() as u64,
            size: u64::MAX,
        }))?;
        if end > self.size()? {
            self.view.resize_body(end)?;
        }
        self.view.write_body(offset, data)
    }

    pub fn resize(&mut self, size: u64) -> Result<()> {
        self.view.resize_body(size)
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.view.read_all_body()
    }

    pub fn remove(self) -> Result<()> {
        self.view.remove()
    }
}
