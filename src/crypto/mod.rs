//! AES-256-GCM sealing of block payloads.
//!
//! Encryption: AES-256-GCM, random nonce prepended to ciphertext, the block
//! key bound as associated data.
//!
//! Sealed payload layout: [ nonce (12 B) | ciphertext | GCM tag (16 B) ]
//!
//! Binding the block key as AAD means a sealed payload only opens under the
//! key it was written for.  Copying or swapping ciphertexts between blocks is
//! detected as an authentication failure.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::Aes256Gcm;
use thiserror::Error;

/// Byte length of the AES-GCM nonce prepended to every sealed payload.
pub const NONCE_LEN: usize = 12;
/// Byte length of the GCM authentication tag.
pub const TAG_LEN: usize = 16;
/// Byte length of an [`EncryptionKey`].
pub const ENCRYPTION_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed: wrong key, tampered ciphertext or relocated block")]
    DecryptionFailed,
    #[error("Sealed payload too short (minimum {} bytes)", NONCE_LEN + TAG_LEN)]
    TooShort,
}

/// 256-bit AES key.  How it is derived is the caller's business.
#[derive(Clone)]
pub struct EncryptionKey([u8; ENCRYPTION_KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; ENCRYPTION_KEY_LEN]) -> Self {
        EncryptionKey(bytes)
    }

    /// Fresh key from the operating system CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ENCRYPTION_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        EncryptionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ENCRYPTION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(******)")
    }
}

/// Size of a sealed payload for `plaintext_len` bytes of plaintext.
pub const fn ciphertext_size(plaintext_len: usize) -> usize {
    plaintext_len + NONCE_LEN + TAG_LEN
}

/// Encrypt `plaintext` with a random nonce, authenticating `aad` alongside.
///
/// Returns `nonce (12 B) || ciphertext || GCM-tag (16 B)`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt`] with the same `aad`.
pub fn decrypt(key: &EncryptionKey, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::TooShort);
    }
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let nonce = aes_gcm::Nonce::from_slice(&data[..NONCE_LEN]);
    cipher
        .decrypt(nonce, Payload { msg: &data[NONCE_LEN..], aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}
