use std::path::{Path, PathBuf};

use super::view::FsBlobView;
use super::{FsBlobError, Result};
use crate::blockstore::BlockStore;
use crate::key::Key;

/// Symbolic link: the body is the UTF-8 target path.
pub struct SymlinkBlob<B: BlockStore> {
    view: FsBlobView<B>,
}

impl<B: BlockStore> SymlinkBlob<B> {
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

    pub fn target(&self) -> Result<PathBuf> {
        let bytes = self.view.read_all_body()?;
        let target = String::from_utf8(bytes).map_err(|_| FsBlobError::InvalidSymlinkTarget)?;
        Ok(PathBuf::from(target))
    }

    pub fn target_len(&self) -> Result<u64> {
        self.view.body_size()
    }

    pub fn set_target(&mut self, target: &Path) -> Result<()> {
        let target = target.to_str().filter(|t| !t.is_empty()).ok_or(FsBlobError::InvalidSymlinkTarget)?;
        self.view.replace_body(target.as_bytes())
    }

    pub fn remove(self) -> Result<()> {
        self.view.remove()
    }
}
