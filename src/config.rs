use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blob::MIN_BLOCK_SIZE;

pub const DEFAULT_BLOCK_SIZE_BYTES: u32 = 32 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings of the blob layer, usually read from a JSON file next to the
/// block directory.
///
/// Missing fields take their defaults, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    /// Physical block size, node header included.  Older config files call
    /// this `blocksize_bytes`.
    #[serde(alias = "blocksize_bytes")]
    pub block_size_bytes: u32,
    /// Upgrade legacy blob headers on load instead of refusing them.
    pub allow_legacy_migration: bool,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            block_size_bytes:       DEFAULT_BLOCK_SIZE_BYTES,
            allow_legacy_migration: true,
        }
    }
}

impl BlobStoreConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if (self.block_size_bytes as usize) < MIN_BLOCK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "block_size_bytes is {}, minimum is {MIN_BLOCK_SIZE}",
                self.block_size_bytes
            )));
        }
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        self.block_size_bytes as usize
    }
}
