use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DriveError, DriveResult};

/// Default size of content blocks written by a write stream.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;
/// Largest block that still fits in one replication frame.
pub const MAX_BLOCK_SIZE: usize = quire_log::MAX_FRAME_SIZE / 2;

/// Drive settings, loadable from a `quire.toml`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Fetch content blocks only when read or explicitly downloaded.
    pub sparse: bool,
    /// Maximum bytes per content block.
    pub block_size: usize,
    /// Outstanding block requests per replicated feed.
    pub max_requests: usize,
    /// Storage root for directory-backed drives.
    pub storage: Option<PathBuf>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            sparse: false,
            block_size: DEFAULT_BLOCK_SIZE,
            max_requests: 16,
            storage: None,
        }
    }
}

impl DriveConfig {
    pub fn sparse() -> Self {
        Self {
            sparse: true,
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> DriveResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| DriveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> DriveResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> DriveResult<String> {
        toml::to_string_pretty(self).map_err(|e| DriveError::Config(e.to_string()))
    }

    pub fn validate(&self) -> DriveResult<()> {
        if self.block_size == 0 {
            return Err(DriveError::Config("block_size must be positive".into()));
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(DriveError::Config(format!(
                "block_size {} exceeds {MAX_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if self.max_requests == 0 {
            return Err(DriveError::Config("max_requests must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = DriveConfig::default();
        assert!(!c.sparse);
        assert_eq!(c.block_size, 65536);
        assert_eq!(c.max_requests, 16);
        assert!(c.storage.is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = DriveConfig::from_toml_str("sparse = true\n").unwrap();
        assert!(c.sparse);
        assert_eq!(c.block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn toml_roundtrip() {
        let c = DriveConfig {
            storage: Some("/tmp/drive".into()),
            max_requests: 4,
            ..DriveConfig::sparse()
        };
        let text = c.to_toml_string().unwrap();
        assert_eq!(DriveConfig::from_toml_str(&text).unwrap(), c);
    }

    #[test]
    fn zero_block_size_rejected() {
        let err = DriveConfig::from_toml_str("block_size = 0").unwrap_err();
        assert!(matches!(err, DriveError::Config(_)));
    }

    #[test]
    fn oversized_block_size_rejected() {
        let config = DriveConfig {
            block_size: MAX_BLOCK_SIZE + 1,
            ..DriveConfig::default()
        };
        assert!(matches!(config.validate(), Err(DriveError::Config(_))));
    }

    #[test]
    fn unknown_types_rejected() {
        assert!(DriveConfig::from_toml_str("sparse = \"yes\"").is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quire.toml");
        std::fs::write(&path, "max_requests = 2").unwrap();
        assert_eq!(DriveConfig::load(&path).unwrap().max_requests, 2);
    }
}
