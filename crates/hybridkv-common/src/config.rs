//! Configuration types for HybridKV
//!
//! All sections deserialize with defaults so a partial TOML file is enough.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for a store
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the main log (`hlog.log`) and the object log
    /// (`hlog.obj.log`). `None` keeps both logs in memory.
    pub data_dir: Option<PathBuf>,
    /// Hash index configuration
    pub index: IndexConfig,
    /// Hybrid log configuration
    pub log: LogConfig,
    /// Checkpoint configuration
    pub checkpoint: CheckpointConfig,
}

impl StoreConfig {
    /// Config rooted at a data directory, with checkpoints in `<dir>/checkpoints`
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            checkpoint: CheckpointConfig {
                dir: Some(dir.join("checkpoints")),
                ..Default::default()
            },
            data_dir: Some(dir),
            ..Default::default()
        }
    }

    /// Main log file path, if file-backed
    #[must_use]
    pub fn log_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("hlog.log"))
    }

    /// Object log file path, if file-backed
    #[must_use]
    pub fn object_log_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("hlog.obj.log"))
    }

    /// Check that the settings are mutually consistent
    pub fn validate(&self) -> Result<()> {
        self.index.validate()?;
        self.log.validate()?;
        Ok(())
    }
}

/// Hash index configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Initial number of slots (power of two)
    pub slot_count: u64,
    /// Load factor above which the table doubles in the background
    pub grow_load_factor: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            slot_count: 1 << 16,
            grow_load_factor: 0.75,
        }
    }
}

impl IndexConfig {
    fn validate(&self) -> Result<()> {
        if self.slot_count < 2 || !self.slot_count.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "index.slot_count must be a power of two >= 2, got {}",
                self.slot_count
            )));
        }
        if !(self.grow_load_factor > 0.0 && self.grow_load_factor <= 1.0) {
            return Err(Error::Configuration(format!(
                "index.grow_load_factor must be in (0, 1], got {}",
                self.grow_load_factor
            )));
        }
        Ok(())
    }
}

/// Hybrid log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// log2 of the in-memory buffer size
    pub memory_bits: u32,
    /// log2 of the page size
    pub page_bits: u32,
    /// Fraction of the in-memory pages kept mutable
    pub mutable_fraction: f64,
    /// Encoded values larger than this go to the object log
    pub object_log_threshold: usize,
    /// Cache records fetched from disk
    pub read_cache_enabled: bool,
    /// Read cache capacity in records
    pub read_cache_capacity: usize,
    /// Background I/O worker threads
    pub io_threads: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            memory_bits: 24, // 16 MB
            page_bits: 20,   // 1 MB
            mutable_fraction: 0.9,
            object_log_threshold: 64 * 1024,
            read_cache_enabled: true,
            read_cache_capacity: 16 * 1024,
            io_threads: 2,
        }
    }
}

impl LogConfig {
    /// Minimum page size (4 KB)
    pub const MIN_PAGE_BITS: u32 = 12;

    /// Maximum page size (1 GB)
    pub const MAX_PAGE_BITS: u32 = 30;

    /// Page size in bytes
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        1 << self.page_bits
    }

    /// Number of in-memory page frames
    #[must_use]
    pub const fn buffer_pages(&self) -> u64 {
        1 << (self.memory_bits - self.page_bits)
    }

    /// Number of pages behind the tail that stay mutable
    #[must_use]
    pub fn mutable_pages(&self) -> u64 {
        let pages = self.buffer_pages();
        let mutable = (pages as f64 * self.mutable_fraction) as u64;
        mutable.clamp(1, pages - 1)
    }

    /// Value size above which values go to the object log, capped so that
    /// an inline record always fits in a page
    #[must_use]
    pub fn effective_object_log_threshold(&self) -> usize {
        self.object_log_threshold.min((self.page_size() / 4) as usize)
    }

    /// Check the log settings on their own
    pub fn validate(&self) -> Result<()> {
        if !(Self::MIN_PAGE_BITS..=Self::MAX_PAGE_BITS).contains(&self.page_bits) {
            return Err(Error::Configuration(format!(
                "log.page_bits must be within {}..={}, got {}",
                Self::MIN_PAGE_BITS,
                Self::MAX_PAGE_BITS,
                self.page_bits
            )));
        }
        if self.memory_bits < self.page_bits + 1 {
            return Err(Error::Configuration(format!(
                "log.memory_bits ({}) must allow at least two pages of 2^{} bytes",
                self.memory_bits, self.page_bits
            )));
        }
        if self.memory_bits - self.page_bits > 20 {
            return Err(Error::Configuration(
                "log.memory_bits - log.page_bits must not exceed 20".into(),
            ));
        }
        if !(self.mutable_fraction > 0.0 && self.mutable_fraction <= 1.0) {
            return Err(Error::Configuration(format!(
                "log.mutable_fraction must be in (0, 1], got {}",
                self.mutable_fraction
            )));
        }
        if self.io_threads == 0 {
            return Err(Error::Configuration("log.io_threads must be at least 1".into()));
        }
        if self.read_cache_enabled && self.read_cache_capacity == 0 {
            return Err(Error::Configuration(
                "log.read_cache_capacity must be positive when the read cache is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Checkpoint configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for checkpoint generations. Required to checkpoint.
    pub dir: Option<PathBuf>,
    /// Recover from the latest checkpoint when the store opens
    pub try_recover_latest: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.log.page_size(), 1 << 20);
        assert_eq!(config.log.buffer_pages(), 16);
        assert_eq!(config.log.mutable_pages(), 14);
        assert!(config.log_path().is_none());
    }

    #[test]
    fn test_with_data_dir() {
        let config = StoreConfig::with_data_dir("/tmp/kv");
        assert_eq!(config.log_path(), Some(PathBuf::from("/tmp/kv/hlog.log")));
        assert_eq!(
            config.object_log_path(),
            Some(PathBuf::from("/tmp/kv/hlog.obj.log"))
        );
        assert_eq!(
            config.checkpoint.dir,
            Some(PathBuf::from("/tmp/kv/checkpoints"))
        );
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = StoreConfig::default();
        config.index.slot_count = 1000;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = StoreConfig::default();
        config.log.memory_bits = config.log.page_bits;
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.log.page_bits = 8;
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.log.io_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mutable_pages_clamped() {
        let log = LogConfig {
            memory_bits: 13,
            page_bits: 12,
            mutable_fraction: 1.0,
            ..Default::default()
        };
        assert_eq!(log.buffer_pages(), 2);
        assert_eq!(log.mutable_pages(), 1);
        assert_eq!(log.effective_object_log_threshold(), 1024);
    }

    #[test]
    fn test_partial_deserialize() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"log": {"page_bits": 12, "memory_bits": 16}}"#).unwrap();
        assert_eq!(config.log.page_bits, 12);
        assert_eq!(config.log.io_threads, 2);
        assert_eq!(config.index.slot_count, 1 << 16);
    }
}
