//! Tunables for serialization and lazy decoding
//!
//! Stored as JSON, e.g. `boc.json`:
//!
//! ```json
//! { "boc": { "mode": 2, "max_roots": 1, "verify_crc32c": true },
//!   "lazy": { "check_crc32c": false, "cache_cells": true } }
//! ```

use crate::boc::Mode;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bag-of-cells codec settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BocConfig {
    /// Mode flags used when serializing (see `boc::Mode`)
    pub mode: u32,
    /// Upper bound on roots accepted when deserializing
    pub max_roots: usize,
    pub verify_crc32c: bool,
}

impl Default for BocConfig {
    fn default() -> Self {
        BocConfig {
            mode: 0,
            max_roots: 16384,
            verify_crc32c: true,
        }
    }
}

/// Lazy deserializer settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LazyOptions {
    /// Check the trailing checksum when the blob is opened (reads the whole blob)
    pub check_crc32c: bool,
    /// Keep every decoded cell instead of only those flagged by cache bits
    pub cache_cells: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub boc: BocConfig,
    pub lazy: LazyOptions,
}

impl BocConfig {
    pub fn serialization_mode(&self) -> Mode {
        Mode::from_bits_truncate(self.mode)
    }
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        Self::from_json_str(&content)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_from_partial_json() {
        let config = EngineConfig::from_json_str(r#"{ "boc": { "mode": 31 } }"#).unwrap();
        assert_eq!(config.boc.serialization_mode(), Mode::ALL);
        assert!(config.boc.verify_crc32c);
        assert_eq!(config.lazy, LazyOptions::default());
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("boc.json");
        let mut config = EngineConfig::default();
        config.lazy.cache_cells = true;
        config.boc.max_roots = 4;
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            EngineConfig::from_json_str("{ nope"),
            Err(Error::Config(_))
        ));
    }
}
