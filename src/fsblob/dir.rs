//! Directory blobs.
//!
//! The body is a list of entries sorted by child key.  Each entry:
//!
//! | Size | Field |
//! |------|-------|
//! | 1 | entry type |
//! | 4 | mode (u32 LE) |
//! | 4 | uid (u32 LE) |
//! | 4 | gid (u32 LE) |
//! | 12 | last access time (i64 secs LE + u32 nanos LE) |
//! | 12 | last modification time |
//! | 12 | last metadata change time |
//! | n+1 | name, NUL-terminated |
//! | 16 | child blob key |
//!
//! The list is parsed once at load and rewritten in full, in one blob
//! transaction, on every change.

use std::io::{self, BufRead, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};

use super::layout::EntryType;
use super::view::FsBlobView;
use super::{FsBlobError, Result};
use crate::blockstore::BlockStore;
use crate::key::{Key, KEY_SIZE};

/// Size reported to `lstat` for every directory.
pub const DIR_LSTAT_SIZE: u64 = 4096;

// ── DirEntry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub entry_type:                EntryType,
    pub name:                      String,
    pub key:                       Key,
    pub mode:                      u32,
    pub uid:                       u32,
    pub gid:                       u32,
    pub last_access_time:          DateTime<Utc>,
    pub last_modification_time:    DateTime<Utc>,
    pub last_metadata_change_time: DateTime<Utc>,
}

impl DirEntry {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.entry_type.as_byte())?;
        writer.write_u32::<LittleEndian>(self.mode)?;
        writer.write_u32::<LittleEndian>(self.uid)?;
        writer.write_u32::<LittleEndian>(self.gid)?;
        write_timestamp(&mut writer, &self.last_access_time)?;
        write_timestamp(&mut writer, &self.last_modification_time)?;
        write_timestamp(&mut writer, &self.last_metadata_change_time)?;
        writer.write_all(self.name.as_bytes())?;
        writer.write_u8(0)?;
        writer.write_all(self.key.as_bytes())?;
        Ok(())
    }

    pub fn read(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        let entry_type = EntryType::from_byte(reader.read_u8().map_err(truncated)?)
            .map_err(|e| FsBlobError::CorruptDirectory(e.to_string()))?;
        let mode = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        let uid = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        let gid = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        let last_access_time = read_timestamp(reader)?;
        let last_modification_time = read_timestamp(reader)?;
        let last_metadata_change_time = read_timestamp(reader)?;

        let mut name = Vec::new();
        reader.read_until(0, &mut name).map_err(truncated)?;
        if name.pop() != Some(0) {
            return Err(FsBlobError::CorruptDirectory("unterminated entry name".to_string()));
        }
        let name = String::from_utf8(name)
            .map_err(|_| FsBlobError::CorruptDirectory("entry name is not UTF-8".to_string()))?;

        let mut key = [0u8; KEY_SIZE];
        reader.read_exact(&mut key).map_err(truncated)?;

        Ok(Self {
            entry_type,
            name,
            key: Key::from_bytes(key),
            mode,
            uid,
            gid,
            last_access_time,
            last_modification_time,
            last_metadata_change_time,
        })
    }
}

fn write_timestamp<W: Write>(writer: &mut W, time: &DateTime<Utc>) -> io::Result<()> {
    writer.write_i64::<LittleEndian>(time.timestamp())?;
    writer.write_u32::<LittleEndian>(time.timestamp_subsec_nanos())
}

fn read_timestamp<R: Read>(reader: &mut R) -> Result<DateTime<Utc>> {
    let secs = reader.read_i64::<LittleEndian>().map_err(truncated)?;
    let nanos = reader.read_u32::<LittleEndian>().map_err(truncated)?;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| FsBlobError::CorruptDirectory(format!("timestamp {secs}.{nanos:09} out of range")))
}

fn truncated(_: io::Error) -> FsBlobError {
    FsBlobError::CorruptDirectory("truncated entry".to_string())
}

fn encode_entries(entries: &[DirEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        // Writing into a Vec cannot fail.
        let _ = entry.write(&mut out);
    }
    out
}

fn decode_entries(body: &[u8]) -> Result<Vec<DirEntry>> {
    let mut reader = Cursor::new(body);
    let mut entries: Vec<DirEntry> = Vec::new();
    while (reader.position() as usize) < body.len() {
        let entry = DirEntry::read(&mut reader)?;
        if entries.last().is_some_and(|prev| prev.key >= entry.key) {
            return Err(FsBlobError::CorruptDirectory("entries out of order".to_string()));
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(FsBlobError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ── DirBlob ──────────────────────────────────────────────────────────────────

pub struct DirBlob<B: BlockStore> {
    view:    FsBlobView<B>,
    entries: Vec<DirEntry>,
}

impl<B: BlockStore> DirBlob<B> {
    pub(crate) fn new_empty(view: FsBlobView<B>) -> Self {
        Self { view, entries: Vec::new() }
    }

    pub(crate) fn load(view: FsBlobView<B>) -> Result<Self> {
        let entries = decode_entries(&view.read_all_body()?)?;
        Ok(Self { view, entries })
    }

    pub fn view(&self) -> &FsBlobView<B> {
        &self.view
    }

    /// Body writes through the view bypass the cached entry list.
    pub(crate) fn view_mut(&mut self) -> &mut FsBlobView<B> {
        &mut self.view
    }

    pub fn key(&self) -> &Key {
        self.view.key()
    }

    pub fn parent(&self) -> Result<Key> {
        self.view.parent()
    }

    pub fn set_parent(&mut self, parent: &Key) -> Result<()> {
        self.view.set_parent(parent)
    }

    /// Entries sorted by child key.
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn get_child(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn get_child_by_key(&self, key: &Key) -> Option<&DirEntry> {
        self.find_by_key(key).ok().map(|i| &self.entries[i])
    }

    fn find_by_key(&self, key: &Key) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.cmp(key))
    }

    fn index_of(&self, key: &Key) -> Result<usize> {
        self.find_by_key(key).map_err(|_| FsBlobError::EntryNotFound(key.to_hex()))
    }

    /// Persist `entries` and adopt them as the cached list.
    fn commit(&mut self, entries: Vec<DirEntry>) -> Result<()> {
        self.view.replace_body(&encode_entries(&entries))?;
        self.entries = entries;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_child(
        &mut self,
        name: &str,
        key: &Key,
        entry_type: EntryType,
        mode: u32,
        uid: u32,
        gid: u32,
        last_access_time: DateTime<Utc>,
        last_modification_time: DateTime<Utc>,
    ) -> Result<()> {
        validate_name(name)?;
        if self.get_child(name).is_some() {
            return Err(FsBlobError::EntryAlreadyExists(name.to_string()));
        }
        let pos = match self.find_by_key(key) {
            Ok(_) => return Err(FsBlobError::EntryAlreadyExists(key.to_hex())),
            Err(pos) => pos,
        };
        let mut entries = self.entries.clone();
        entries.insert(pos, DirEntry {
            entry_type,
            name: name.to_string(),
            key: *key,
            mode,
            uid,
            gid,
            last_access_time,
            last_modification_time,
            last_metadata_change_time: Utc::now(),
        });
        self.commit(entries)?;
        tracing::debug!(dir = %self.key(), child = %key, name, "added directory entry");
        Ok(())
    }

    /// Like [`add_child`](Self::add_child), but an existing entry with the
    /// same name is replaced.
    #[allow(clippy::too_many_arguments)]
    pub fn add_or_overwrite_child(
        &mut self,
        name: &str,
        key: &Key,
        entry_type: EntryType,
        mode: u32,
        uid: u32,
        gid: u32,
        last_access_time: DateTime<Utc>,
        last_modification_time: DateTime<Utc>,
    ) -> Result<()> {
        validate_name(name)?;
        if self.get_child_by_key(key).is_some_and(|e| e.name != name) {
            return Err(FsBlobError::EntryAlreadyExists(key.to_hex()));
        }
        let mut entries: Vec<DirEntry> = self.entries.iter().filter(|e| e.name != name).cloned().collect();
        let pos = entries.binary_search_by(|e| e.key.cmp(key)).unwrap_or_else(|pos| pos);
        entries.insert(pos, DirEntry {
            entry_type,
            name: name.to_string(),
            key: *key,
            mode,
            uid,
            gid,
            last_access_time,
            last_modification_time,
            last_metadata_change_time: Utc::now(),
        });
        self.commit(entries)
    }

    pub fn rename_child(&mut self, key: &Key, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        let index = self.index_of(key)?;
        if self.get_child(new_name).is_some_and(|e| e.key != *key) {
            return Err(FsBlobError::EntryAlreadyExists(new_name.to_string()));
        }
        let mut entries = self.entries.clone();
        entries[index].name = new_name.to_string();
        entries[index].last_metadata_change_time = Utc::now();
        self.commit(entries)
    }

    pub fn remove_child_by_name(&mut self, name: &str) -> Result<()> {
        let key = self.get_child(name).map(|e| e.key).ok_or_else(|| FsBlobError::EntryNotFound(name.to_string()))?;
        self.remove_child_by_key(&key)
    }

    pub fn remove_child_by_key(&mut self, key: &Key) -> Result<()> {
        let index = self.index_of(key)?;
        let mut entries = self.entries.clone();
        entries.remove(index);
        self.commit(entries)?;
        tracing::debug!(dir = %self.key(), child = %key, "removed directory entry");
        Ok(())
    }

    fn update_entry(&mut self, key: &Key, f: impl FnOnce(&mut DirEntry)) -> Result<()> {
        let index = self.index_of(key)?;
        let mut entries = self.entries.clone();
        f(&mut entries[index]);
        self.commit(entries)
    }

    pub fn set_mode(&mut self, key: &Key, mode: u32) -> Result<()> {
        self.update_entry(key, |e| {
            e.mode = mode;
            e.last_metadata_change_time = Utc::now();
        })
    }

    pub fn set_uid_gid(&mut self, key: &Key, uid: u32, gid: u32) -> Result<()> {
        self.update_entry(key, |e| {
            e.uid = uid;
            e.gid = gid;
            e.last_metadata_change_time = Utc::now();
        })
    }

    pub fn set_access_times(
        &mut self,
        key: &Key,
        last_access_time: DateTime<Utc>,
        last_modification_time: DateTime<Utc>,
    ) -> Result<()> {
        self.update_entry(key, |e| {
            e.last_access_time = last_access_time;
            e.last_modification_time = last_modification_time;
            e.last_metadata_change_time = Utc::now();
        })
    }

    pub fn update_access_timestamp(&mut self, key: &Key) -> Result<()> {
        self.update_entry(key, |e| e.last_access_time = Utc::now())
    }

    pub fn update_modification_timestamp(&mut self, key: &Key) -> Result<()> {
        self.update_entry(key, |e| {
            let now = Utc::now();
            e.last_modification_time = now;
            e.last_metadata_change_time = now;
        })
    }

    /// Release the directory's own blocks.  Children are separate blobs and
    /// are not touched.
    pub fn remove(self) -> Result<()> {
        self.view.remove()
    }
}
