//! Configuration constants and types for the volume key core.

use crate::error::{Error, Result};
use crate::random::{KeyRng, RandomQuality};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// log2 of the sector size.
pub const SECTOR_SHIFT: u32 = 9;

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

/// Default data alignment on disk (1 MiB).
pub const DEFAULT_DISK_ALIGNMENT: u64 = 1_048_576;

/// Default alignment of in-memory I/O buffers.
pub const DEFAULT_MEM_ALIGNMENT: usize = 4096;

/// Maximum length of a diagnostic message, in bytes.
pub const MAX_ERROR_LENGTH: usize = 512;

/// Upper bound on a volume key length, in bytes.
pub const MAX_VOLUME_KEY_LENGTH: usize = 4096;

/// Process priority applied while memory is locked.
pub const DEFAULT_PROCESS_PRIORITY: i32 = -18;

/// Secure wipe parameters.
pub mod wipe_params {
    /// Random passes before the fixed patterns on rotational media.
    pub const LEADING_RANDOM_PASSES: u8 = 4;

    /// Random passes after the fixed patterns on rotational media.
    pub const TRAILING_RANDOM_PASSES: u8 = 4;

    /// Random passes on flash media.
    pub const FLASH_PASSES: u8 = 1;

    /// Sectors written per chunk (1 MiB).
    pub const CHUNK_SECTORS: u64 = 2048;

    /// Largest accepted chunk (64 MiB).
    pub const MAX_CHUNK_SECTORS: u64 = 131_072;
}

/// Tunables for the wipe engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WipeConfig {
    /// Normal-tier random passes before the Gutmann patterns.
    pub leading_random_passes: u8,

    /// Normal-tier random passes after the Gutmann patterns.
    pub trailing_random_passes: u8,

    /// Key-tier random passes for flash media.
    pub flash_passes: u8,

    /// Sectors per write; cancellation is checked between chunks.
    pub chunk_sectors: u64,
}

impl WipeConfig {
    /// Validate the wipe tunables.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.chunk_sectors == 0 || self.chunk_sectors > wipe_params::MAX_CHUNK_SECTORS {
            return Err(format!(
                "Wipe chunk must be between 1 and {} sectors",
                wipe_params::MAX_CHUNK_SECTORS
            ));
        }
        if self.flash_passes == 0 {
            return Err("Flash wipe needs at least one pass".to_string());
        }
        Ok(())
    }
}

impl Default for WipeConfig {
    fn default() -> Self {
        Self {
            leading_random_passes: wipe_params::LEADING_RANDOM_PASSES,
            trailing_random_passes: wipe_params::TRAILING_RANDOM_PASSES,
            flash_passes: wipe_params::FLASH_PASSES,
            chunk_sectors: wipe_params::CHUNK_SECTORS,
        }
    }
}

/// Process-wide configuration of the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Emit debug-level diagnostics.
    pub debug: bool,

    /// Source backing the key-quality tier.
    pub default_key_rng: KeyRng,

    /// Tier used when a caller does not name one.
    pub default_quality: RandomQuality,

    /// Refuse to allocate keys when process memory cannot be locked.
    pub require_locked_memory: bool,

    /// Raise process priority while memory is locked.
    pub raise_priority: bool,

    /// Data alignment used when the device reports no topology.
    pub disk_alignment: u64,

    /// Wipe engine tunables.
    pub wipe: WipeConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            debug: false,
            default_key_rng: KeyRng::Urandom,
            default_quality: RandomQuality::Normal,
            require_locked_memory: false,
            raise_priority: true,
            disk_alignment: DEFAULT_DISK_ALIGNMENT,
            wipe: WipeConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoreConfig = serde_json::from_str(&content)?;
        config.validate().map_err(Error::Config)?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.disk_alignment == 0
            || !self.disk_alignment.is_power_of_two()
            || self.disk_alignment % SECTOR_SIZE != 0
        {
            return Err(format!(
                "Disk alignment must be a power of 2 and a multiple of {} bytes",
                SECTOR_SIZE
            ));
        }
        self.wipe.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_unaligned_disk_alignment() {
        let config = CoreConfig {
            disk_alignment: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_chunk() {
        let mut config = CoreConfig::default();
        config.wipe.chunk_sectors = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"{ "debug": true, "default_key_rng": "random" }"#).unwrap();

        let config = CoreConfig::from_json_file(file.path()).unwrap();
        assert!(config.debug);
        assert_eq!(config.default_key_rng, KeyRng::Random);
        assert_eq!(config.disk_alignment, DEFAULT_DISK_ALIGNMENT);
        assert_eq!(config.wipe, WipeConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let file = NamedTempFile::new().unwrap();
        let mut config = CoreConfig::default();
        config.wipe.flash_passes = 3;
        config.save(file.path()).unwrap();

        let loaded = CoreConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{ not json").unwrap();
        assert!(matches!(
            CoreConfig::from_json_file(file.path()),
            Err(Error::Config(_))
        ));
    }
}
