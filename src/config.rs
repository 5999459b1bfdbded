//! Configuration for buddykv
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{BuddyError, Result};
use crate::format::MIN_SECTOR_SIZE;

/// Main configuration for a file-backed store
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Path of the single backing file
    pub path: PathBuf,

    /// Create the backing file when it does not exist yet
    pub create_if_missing: bool,

    // -------------------------------------------------------------------------
    // Durability Configuration
    // -------------------------------------------------------------------------
    /// Atomic-write granularity of the device, in bytes.
    ///
    /// `None` asks the filesystem for its preferred block size and falls back
    /// to 512. Records no larger than this are written with a single write;
    /// larger ones are written payload first and header last.
    pub sector_size: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./buddykv.db"),
            create_if_missing: true,
            sector_size: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the values that cannot be expressed by the types alone
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.sector_size {
            if !size.is_power_of_two() || size < MIN_SECTOR_SIZE {
                return Err(BuddyError::Config(format!(
                    "sector size must be a power of two >= {}, got {}",
                    MIN_SECTOR_SIZE, size
                )));
            }
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the backing file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Create the file if it is missing (default: true)
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.config.create_if_missing = create;
        self
    }

    /// Override the detected atomic-write granularity (in bytes)
    pub fn sector_size(mut self, size: u64) -> Self {
        self.config.sector_size = Some(size);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
