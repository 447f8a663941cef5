//! Block and blob identifiers.
//!
//! A [`Key`] names a block in a [`BlockStore`](crate::blockstore::BlockStore)
//! and, through its root block, a whole blob.  Keys are location addresses,
//! not content hashes: the block behind a key is mutated in place.
//!
//! # Encoding
//! On disk a key is always its raw 16 bytes.  For display and file names it
//! is rendered as 32 lowercase hex characters.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use thiserror::Error;

/// Byte length of a [`Key`].
pub const KEY_SIZE: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("Key must be {expected} hex characters, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("Key is not valid hex: {0}")]
    InvalidHex(String),
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// Draw a fresh key from the operating system CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Key(bytes)
    }

    /// The all-zero key.  Used as the parent of the root directory blob.
    pub const fn zero() -> Self {
        Key([0u8; KEY_SIZE])
    }

    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }

    /// Build a key from a slice that must be exactly [`KEY_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; KEY_SIZE] = bytes.try_into().ok()?;
        Some(Key(array))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyParseError> {
        if s.len() != KEY_SIZE * 2 {
            return Err(KeyParseError::WrongLength { expected: KEY_SIZE * 2, actual: s.len() });
        }
        let mut bytes = [0u8; KEY_SIZE];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| KeyParseError::InvalidHex(e.to_string()))?;
        Ok(Key(bytes))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

impl FromStr for Key {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::from_hex(s)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let key = Key::from_hex("1491ba5b4a1e8c4b2e9c6a1f0d3e7b55").unwrap();
        assert_eq!(key.to_string(), "1491ba5b4a1e8c4b2e9c6a1f0d3e7b55");
        assert_eq!("1491ba5b4a1e8c4b2e9c6a1f0d3e7b55".parse::<Key>().unwrap(), key);
    }

    #[test]
    fn rejects_bad_hex() {
        assert_eq!(
            Key::from_hex("abcd"),
            Err(KeyParseError::WrongLength { expected: 32, actual: 4 })
        );
        assert!(matches!(
            Key::from_hex("zz91ba5b4a1e8c4b2e9c6a1f0d3e7b55"),
            Err(KeyParseError::InvalidHex(_))
        ));
    }

    #[test]
    fn random_keys_differ() {
        assert_ne!(Key::random(), Key::random());
        assert_ne!(Key::random(), Key::zero());
    }

    #[test]
    fn from_slice_checks_length() {
        assert!(Key::from_slice(&[1u8; 15]).is_none());
        assert_eq!(Key::from_slice(&[7u8; 16]), Some(Key::from_bytes([7u8; 16])));
    }
}
