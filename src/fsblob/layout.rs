//! Versioned header at the front of every filesystem blob.
//!
//! # Current layout (format version 1)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 2 | format version, u16 LE, non-zero |
//! | 2 | 1 | entry type |
//! | 3 | 16 | parent key |
//! | 19 | ... | entry body |
//!
//! # Legacy layout (format version 0)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 2 | `0x0000` |
//! | 2 | 1 | entry type |
//! | 3 | ... | entry body |
//!
//! The legacy layout has no parent pointer.  Such blobs are upgraded in place
//! by [`migrate`](super::view::migrate) the first time they are loaded.

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{FsBlobError, Result};
use crate::key::{Key, KEY_SIZE};

/// Format version written by this build.
pub const FORMAT_VERSION_HEADER: u16 = 1;
/// Format version of headers without a parent pointer.
pub const LEGACY_FORMAT_VERSION: u16 = 0;

pub const FORMAT_VERSION_SIZE: usize = std::mem::size_of::<u16>();
pub const ENTRY_TYPE_SIZE: usize = std::mem::size_of::<u8>();

pub const ENTRY_TYPE_OFFSET: usize = FORMAT_VERSION_SIZE;
pub const PARENT_OFFSET: usize = FORMAT_VERSION_SIZE + ENTRY_TYPE_SIZE;

/// Header length of the legacy layout.
pub const OLD_HEADER_SIZE: usize = FORMAT_VERSION_SIZE + ENTRY_TYPE_SIZE;
/// Header length of the current layout.
pub const HEADER_SIZE: usize = FORMAT_VERSION_SIZE + ENTRY_TYPE_SIZE + KEY_SIZE;

// ── EntryType ────────────────────────────────────────────────────────────────

const MAGIC_DIR: u8 = 0x00;
const MAGIC_FILE: u8 = 0x01;
const MAGIC_SYMLINK: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    Dir,
    File,
    Symlink,
}

impl EntryType {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            MAGIC_DIR     => Ok(EntryType::Dir),
            MAGIC_FILE    => Ok(EntryType::File),
            MAGIC_SYMLINK => Ok(EntryType::Symlink),
            other         => Err(FsBlobError::UnknownEntryType(other)),
        }
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        match self {
            EntryType::Dir     => MAGIC_DIR,
            EntryType::File    => MAGIC_FILE,
            EntryType::Symlink => MAGIC_SYMLINK,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntryType::Dir     => "directory",
            EntryType::File    => "file",
            EntryType::Symlink => "symlink",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── HeaderLayout ─────────────────────────────────────────────────────────────

/// Offset table of one header generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLayout {
    Legacy,
    Current,
}

impl HeaderLayout {
    pub fn from_format_version(version: u16) -> Result<Self> {
        match version {
            LEGACY_FORMAT_VERSION => Ok(HeaderLayout::Legacy),
            FORMAT_VERSION_HEADER => Ok(HeaderLayout::Current),
            other                 => Err(FsBlobError::UnsupportedFormatVersion(other)),
        }
    }

    pub const fn format_version(self) -> u16 {
        match self {
            HeaderLayout::Legacy  => LEGACY_FORMAT_VERSION,
            HeaderLayout::Current => FORMAT_VERSION_HEADER,
        }
    }

    pub const fn header_size(self) -> usize {
        match self {
            HeaderLayout::Legacy  => OLD_HEADER_SIZE,
            HeaderLayout::Current => HEADER_SIZE,
        }
    }

    pub const fn entry_type_offset(self) -> usize {
        ENTRY_TYPE_OFFSET
    }

    /// `None` for layouts that do not record a parent.
    pub const fn parent_offset(self) -> Option<usize> {
        match self {
            HeaderLayout::Legacy  => None,
            HeaderLayout::Current => Some(PARENT_OFFSET),
        }
    }

    pub const fn body_offset(self) -> usize {
        self.header_size()
    }
}

// ── FsBlobHeader ─────────────────────────────────────────────────────────────

/// Decoded current-layout header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsBlobHeader {
    pub entry_type: EntryType,
    pub parent:     Key,
}

impl FsBlobHeader {
    pub fn new(entry_type: EntryType, parent: Key) -> Self {
        Self { entry_type, parent }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(FORMAT_VERSION_HEADER)?;
        writer.write_u8(self.entry_type.as_byte())?;
        writer.write_all(self.parent.as_bytes())?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let version = reader.read_u16::<LittleEndian>().map_err(header_io)?;
        if HeaderLayout::from_format_version(version)? != HeaderLayout::Current {
            return Err(FsBlobError::UnsupportedFormatVersion(version));
        }
        let entry_type = EntryType::from_byte(reader.read_u8().map_err(header_io)?)?;
        let mut parent = [0u8; KEY_SIZE];
        reader.read_exact(&mut parent).map_err(header_io)?;
        Ok(Self { entry_type, parent: Key::from_bytes(parent) })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        // A correctly sized slice cannot run out of room.
        let _ = self.write(&mut out[..]);
        out
    }
}

fn header_io(e: io::Error) -> FsBlobError {
    FsBlobError::CorruptHeader(e.to_string())
}
