//! Typed filesystem blobs: files, directories and symlinks.
//!
//! Every filesystem blob starts with a versioned header (see [`layout`])
//! naming its entry type and parent directory.  [`FsBlobStore`] is the entry
//! point: it creates blobs with a current header and, on load, upgrades
//! legacy headers before handing out a typed [`FsBlob`].

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::blob::{BlobError, BlobStore};
use crate::blockstore::BlockStore;
use crate::config::BlobStoreConfig;
use crate::key::Key;

pub mod dir;
pub mod file;
pub mod layout;
mod lease;
pub mod symlink;
pub mod view;

pub use dir::{DirBlob, DirEntry, DIR_LSTAT_SIZE};
pub use file::FileBlob;
pub use layout::{EntryType, FsBlobHeader, HeaderLayout, FORMAT_VERSION_HEADER, HEADER_SIZE, OLD_HEADER_SIZE};
pub use symlink::SymlinkBlob;
pub use view::FsBlobView;

use lease::OpenBlobs;

#[derive(Error, Debug)]
pub enum FsBlobError {
    #[error("Blob error: {0}")]
    Blob(#[from] BlobError),
    #[error("Unknown entry type byte 0x{0:02x}")]
    UnknownEntryType(u8),
    #[error("Unsupported blob format version {0}")]
    UnsupportedFormatVersion(u16),
    #[error("Blob {0} is already open")]
    AlreadyOpen(Key),
    #[error("Blob {0} uses the legacy header format and migration is disabled")]
    LegacyFormat(Key),
    #[error("Blob {key} is too short for its header ({size} bytes)")]
    TooShort { key: Key, size: u64 },
    #[error("Corrupt blob header: {0}")]
    CorruptHeader(String),
    #[error("Expected a {expected}, found a {actual}")]
    WrongEntryType { expected: EntryType, actual: EntryType },
    #[error("Directory entry already exists: {0}")]
    EntryAlreadyExists(String),
    #[error("Directory entry not found: {0}")]
    EntryNotFound(String),
    #[error("Invalid entry name: {0:?}")]
    InvalidName(String),
    #[error("Corrupt directory: {0}")]
    CorruptDirectory(String),
    #[error("Symlink target is not valid UTF-8 or is empty")]
    InvalidSymlinkTarget,
}

pub type Result<T> = std::result::Result<T, FsBlobError>;

// ── FsBlob ───────────────────────────────────────────────────────────────────

pub enum FsBlob<B: BlockStore> {
    File(FileBlob<B>),
    Dir(DirBlob<B>),
    Symlink(SymlinkBlob<B>),
}

impl<B: BlockStore> FsBlob<B> {
    fn from_view(view: FsBlobView<B>) -> Result<Self> {
        Ok(match view.entry_type()? {
            EntryType::File    => FsBlob::File(FileBlob::new(view)),
            EntryType::Dir     => FsBlob::Dir(DirBlob::load(view)?),
            EntryType::Symlink => FsBlob::Symlink(SymlinkBlob::new(view)),
        })
    }

    fn view(&self) -> &FsBlobView<B> {
        match self {
            FsBlob::File(f)    => f.view(),
            FsBlob::Dir(d)     => d.view(),
            FsBlob::Symlink(s) => s.view(),
        }
    }

    fn view_mut(&mut self) -> &mut FsBlobView<B> {
        match self {
            FsBlob::File(f)    => f.view_mut(),
            FsBlob::Dir(d)     => d.view_mut(),
            FsBlob::Symlink(s) => s.view_mut(),
        }
    }

    pub fn key(&self) -> &Key {
        self.view().key()
    }

    pub fn entry_type(&self) -> EntryType {
        match self {
            FsBlob::File(_)    => EntryType::File,
            FsBlob::Dir(_)     => EntryType::Dir,
            FsBlob::Symlink(_) => EntryType::Symlink,
        }
    }

    pub fn parent(&self) -> Result<Key> {
        self.view().parent()
    }

    pub fn set_parent(&mut self, parent: &Key) -> Result<()> {
        self.view_mut().set_parent(parent)
    }

    /// Size reported to `lstat`.
    pub fn lstat_size(&self) -> Result<u64> {
        match self {
            FsBlob::File(f)    => f.size(),
            FsBlob::Dir(_)     => Ok(DIR_LSTAT_SIZE),
            FsBlob::Symlink(s) => s.target_len(),
        }
    }

    pub fn remove(self) -> Result<()> {
        match self {
            FsBlob::File(f)    => f.remove(),
            FsBlob::Dir(d)     => d.remove(),
            FsBlob::Symlink(s) => s.remove(),
        }
    }

    pub fn into_file(self) -> Result<FileBlob<B>> {
        match self {
            FsBlob::File(f) => Ok(f),
            other => Err(wrong_type(EntryType::File, &other)),
        }
    }

    pub fn into_dir(self) -> Result<DirBlob<B>> {
        match self {
            FsBlob::Dir(d) => Ok(d),
            other => Err(wrong_type(EntryType::Dir, &other)),
        }
    }

    pub fn into_symlink(self) -> Result<SymlinkBlob<B>> {
        match self {
            FsBlob::Symlink(s) => Ok(s),
            other => Err(wrong_type(EntryType::Symlink, &other)),
        }
    }
}

fn wrong_type<B: BlockStore>(expected: EntryType, actual: &FsBlob<B>) -> FsBlobError {
    FsBlobError::WrongEntryType { expected, actual: actual.entry_type() }
}

// ── FsBlobStore ──────────────────────────────────────────────────────────────

/// Loads and creates filesystem blobs on top of a [`BlobStore`].
///
/// At most one handle per blob key is live at a time: loading a key whose
/// handle has not been dropped yet fails with [`FsBlobError::AlreadyOpen`].
/// This holds per store; two stores over one block store do not coordinate.
pub struct FsBlobStore<B: BlockStore> {
    blobs:                  BlobStore<B>,
    allow_legacy_migration: bool,
    open:                   Arc<OpenBlobs>,
}

impl<B: BlockStore> FsBlobStore<B> {
    pub fn new(store: B, config: &BlobStoreConfig) -> Result<Self> {
        let blobs = BlobStore::new(store, config.block_size())?;
        Ok(Self::from_blob_store(blobs, config.allow_legacy_migration))
    }

    pub fn from_blob_store(blobs: BlobStore<B>, allow_legacy_migration: bool) -> Self {
        Self { blobs, allow_legacy_migration, open: Arc::new(OpenBlobs::default()) }
    }

    pub fn blob_store(&self) -> &BlobStore<B> {
        &self.blobs
    }

    fn create_view(&self, entry_type: EntryType, parent: &Key) -> Result<FsBlobView<B>> {
        let blob = self.blobs.create()?;
        let lease = self.open.acquire(blob.key())?;
        let view = FsBlobView::create(blob, entry_type, parent)?.with_lease(lease);
        tracing::debug!(blob = %view.key(), %entry_type, parent = %parent, "created fs blob");
        Ok(view)
    }

    pub fn create_file(&self, parent: &Key) -> Result<FileBlob<B>> {
        Ok(FileBlob::new(self.create_view(EntryType::File, parent)?))
    }

    pub fn create_dir(&self, parent: &Key) -> Result<DirBlob<B>> {
        Ok(DirBlob::new_empty(self.create_view(EntryType::Dir, parent)?))
    }

    pub fn create_symlink(&self, target: &Path, parent: &Key) -> Result<SymlinkBlob<B>> {
        let mut symlink = SymlinkBlob::new(self.create_view(EntryType::Symlink, parent)?);
        if let Err(e) = symlink.set_target(target) {
            // don't leave a half-initialized blob behind
            if let Err(remove_err) = symlink.remove() {
                tracing::warn!(error = %remove_err, "could not remove symlink blob after failed create");
            }
            return Err(e);
        }
        Ok(symlink)
    }

    /// Create an empty blob of the given type.  Symlinks start with an empty
    /// target.
    pub fn create(&self, entry_type: EntryType, parent: &Key) -> Result<FsBlob<B>> {
        let view = self.create_view(entry_type, parent)?;
        Ok(match entry_type {
            EntryType::File    => FsBlob::File(FileBlob::new(view)),
            EntryType::Dir     => FsBlob::Dir(DirBlob::new_empty(view)),
            EntryType::Symlink => FsBlob::Symlink(SymlinkBlob::new(view)),
        })
    }

    /// Load the blob at `key`.  A legacy header is upgraded in place, taking
    /// `parent_hint` as the recorded parent.
    ///
    /// Fails with [`FsBlobError::AlreadyOpen`] while another handle to `key`
    /// from this store is alive.
    pub fn load(&self, key: &Key, parent_hint: &Key) -> Result<Option<FsBlob<B>>> {
        let lease = self.open.acquire(key)?;
        let Some(mut blob) = self.blobs.load(key)? else {
            return Ok(None);
        };

        let version = view::get_format_version_header(&blob)?;
        let header = HeaderLayout::from_format_version(version)?;
        let size = blob.size()?;
        if size < header.header_size() as u64 {
            return Err(FsBlobError::TooShort { key: *key, size });
        }
        // Reject garbage before rewriting anything.
        let mut entry_type = [0u8; 1];
        blob.read_into(header.entry_type_offset() as u64, &mut entry_type)?;
        EntryType::from_byte(entry_type[0])?;

        if header == HeaderLayout::Legacy {
            if !self.allow_legacy_migration {
                return Err(FsBlobError::LegacyFormat(*key));
            }
            tracing::info!(blob = %key, parent = %parent_hint, "migrating legacy blob header");
            view::migrate(&mut blob, parent_hint)?;
        }

        FsBlob::from_view(FsBlobView::new(blob)?.with_lease(lease)).map(Some)
    }

    /// Whether a handle to `key` handed out by this store is still alive.
    pub fn is_open(&self, key: &Key) -> bool {
        self.open.is_open(key)
    }

    pub fn num_blocks(&self) -> Result<u64> {
        Ok(self.blobs.num_blocks()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::InMemoryBlockStore;

    fn store() -> FsBlobStore<InMemoryBlockStore> {
        let config = BlobStoreConfig { block_size_bytes: 128, ..BlobStoreConfig::default() };
        FsBlobStore::new(InMemoryBlockStore::new(), &config).unwrap()
    }

    fn raw_blob(store: &FsBlobStore<InMemoryBlockStore>, content: &[u8]) -> Key {
        let mut blob = store.blob_store().create().unwrap();
        blob.resize(content.len() as u64).unwrap();
        blob.write(0, content).unwrap();
        *blob.key()
    }

    #[test]
    fn created_blobs_load_with_type_and_parent() {
        let store = store();
        let parent = Key::random();
        let file = *store.create_file(&parent).unwrap().key();
        let dir = *store.create_dir(&parent).unwrap().key();
        let link = *store.create_symlink(Path::new("/etc/hosts"), &parent).unwrap().key();

        for (key, expected) in [(file, EntryType::File), (dir, EntryType::Dir), (link, EntryType::Symlink)] {
            let loaded = store.load(&key, &Key::zero()).unwrap().unwrap();
            assert_eq!(loaded.entry_type(), expected);
            assert_eq!(loaded.parent().unwrap(), parent);
            assert_eq!(loaded.key(), &key);
        }
    }

    #[test]
    fn generic_create_writes_current_header() {
        let store = store();
        let blob = store.create(EntryType::Dir, &Key::zero()).unwrap();
        let raw = store.blob_store().load(blob.key()).unwrap().unwrap().read_all().unwrap();
        assert_eq!(raw.len(), HEADER_SIZE);
        assert_eq!(&raw[..3], &[0x01, 0x00, 0x00]);
        assert_eq!(&raw[3..], &[0u8; 16]);
    }

    #[test]
    fn load_missing_blob_is_none() {
        let store = store();
        assert!(store.load(&Key::random(), &Key::zero()).unwrap().is_none());
    }

    #[test]
    fn load_migrates_legacy_blob() {
        let store = store();
        let parent = Key::random();
        let key = raw_blob(&store, b"\x00\x00\x01hello");
        let file = store.load(&key, &parent).unwrap().unwrap().into_file().unwrap();
        assert_eq!(file.read_all().unwrap(), b"hello");
        assert_eq!(file.view().parent().unwrap(), parent);
    }

    #[test]
    fn load_refuses_legacy_when_migration_disabled() {
        let blobs = BlobStore::new(InMemoryBlockStore::new(), 128).unwrap();
        let store = FsBlobStore::from_blob_store(blobs, false);
        let key = raw_blob(&store, b"\x00\x00\x01hello");
        assert!(matches!(store.load(&key, &Key::zero()), Err(FsBlobError::LegacyFormat(k)) if k == key));
        let raw = store.blob_store().load(&key).unwrap().unwrap().read_all().unwrap();
        assert_eq!(raw, b"\x00\x00\x01hello");
    }

    #[test]
    fn load_rejects_bad_headers() {
        let store = store();
        let unsupported = raw_blob(&store, &[0x05, 0x00, 0x01]);
        assert!(matches!(
            store.load(&unsupported, &Key::zero()),
            Err(FsBlobError::UnsupportedFormatVersion(5))
        ));

        let unknown_type = raw_blob(&store, &[0x00, 0x00, 0x09, b'x']);
        assert!(matches!(store.load(&unknown_type, &Key::zero()), Err(FsBlobError::UnknownEntryType(9))));
        // not migrated
        let raw = store.blob_store().load(&unknown_type).unwrap().unwrap().read_all().unwrap();
        assert_eq!(raw.len(), 4);

        let too_short = raw_blob(&store, &[0x00, 0x00]);
        assert!(matches!(store.load(&too_short, &Key::zero()), Err(FsBlobError::TooShort { size: 2, .. })));

        let one_byte = raw_blob(&store, &[0x01]);
        assert!(matches!(store.load(&one_byte, &Key::zero()), Err(FsBlobError::TooShort { size: 1, .. })));

        let truncated_current = raw_blob(&store, &[0x01, 0x00, 0x01, 0xAA]);
        assert!(matches!(
            store.load(&truncated_current, &Key::zero()),
            Err(FsBlobError::TooShort { size: 4, .. })
        ));
    }

    #[test]
    fn wrong_type_conversion_fails() {
        let store = store();
        let key = *store.create_file(&Key::zero()).unwrap().key();
        let blob = store.load(&key, &Key::zero()).unwrap().unwrap();
        assert!(matches!(
            blob.into_dir(),
            Err(FsBlobError::WrongEntryType { expected: EntryType::Dir, actual: EntryType::File })
        ));
    }

    #[test]
    fn set_parent_persists() {
        let store = store();
        let mut blob = store.create(EntryType::File, &Key::zero()).unwrap();
        let new_parent = Key::random();
        blob.set_parent(&new_parent).unwrap();
        let key = *blob.key();
        drop(blob);
        let reloaded = store.load(&key, &Key::zero()).unwrap().unwrap();
        assert_eq!(reloaded.parent().unwrap(), new_parent);
    }

    #[test]
    fn lstat_sizes() {
        let store = store();
        let mut file = store.create_file(&Key::zero()).unwrap();
        file.write(0, b"twelve bytes").unwrap();
        let file_key = *file.key();
        drop(file);
        let dir_key = *store.create_dir(&Key::zero()).unwrap().key();
        let link_key = *store.create_symlink(Path::new("../target"), &Key::zero()).unwrap().key();

        let lstat = |key: &Key| store.load(key, &Key::zero()).unwrap().unwrap().lstat_size().unwrap();
        assert_eq!(lstat(&file_key), 12);
        assert_eq!(lstat(&dir_key), DIR_LSTAT_SIZE);
        assert_eq!(lstat(&link_key), 9);
    }

    #[test]
    fn second_handle_to_open_blob_is_refused() {
        let store = store();
        let file = store.create_file(&Key::zero()).unwrap();
        let key = *file.key();
        assert!(store.is_open(&key));
        assert!(matches!(store.load(&key, &Key::zero()), Err(FsBlobError::AlreadyOpen(k)) if k == key));

        drop(file);
        assert!(!store.is_open(&key));
        let loaded = store.load(&key, &Key::zero()).unwrap().unwrap();
        assert!(matches!(store.load(&key, &Key::zero()), Err(FsBlobError::AlreadyOpen(_))));
        drop(loaded);
        assert!(store.load(&key, &Key::zero()).unwrap().is_some());
    }

    #[test]
    fn remove_releases_blocks() {
        let store = store();
        let mut file = store.create_file(&Key::zero()).unwrap();
        file.write(0, &[7u8; 2000]).unwrap();
        let key = *file.key();
        drop(file);
        assert!(store.num_blocks().unwrap() > 1);
        store.load(&key, &Key::zero()).unwrap().unwrap().remove().unwrap();
        assert_eq!(store.num_blocks().unwrap(), 0);
        assert!(store.load(&key, &Key::zero()).unwrap().is_none());
    }
}
