//! Store configuration
//!
//! `StoreConfig` follows a builder style: start from `StoreConfig::new()` and
//! chain setters. It can also be deserialized from JSON; missing fields take
//! their default values.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default page size in bytes
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size (slot offsets are 16-bit)
pub const MAX_PAGE_SIZE: usize = 32768;

/// Default store size limit in pages (1 GiB with 4 KiB pages)
pub const DEFAULT_MAX_PAGES: u32 = 262_144;

/// Default name of the data file inside the store directory
pub const DEFAULT_FILE_NAME: &str = "data.boxdb";

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Page size used when creating a new store
    pub page_size: usize,
    /// Upper bound on the number of pages in the data file
    pub max_pages: u32,
    /// Number of decoded pages kept in the page cache
    pub cache_pages: usize,
    /// Whether commits fsync the data file
    pub sync_on_commit: bool,
    /// Retries performed by `Store::run_in_write` on write conflicts
    pub max_conflict_retries: u32,
    /// Data file name inside the store directory
    pub file_name: String,
    /// Pages whose live-record ratio is below this are rewritten by `Store::compact`
    pub compact_threshold: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            cache_pages: 1024,
            sync_on_commit: true,
            max_conflict_retries: 8,
            file_name: DEFAULT_FILE_NAME.to_string(),
            compact_threshold: 0.5,
        }
    }
}

impl StoreConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the store size limit in pages
    pub fn max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Set the page cache capacity
    pub fn cache_pages(mut self, cache_pages: usize) -> Self {
        self.cache_pages = cache_pages;
        self
    }

    /// Enable or disable fsync on commit
    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Set the conflict retry budget of `run_in_write`
    pub fn max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Set the data file name
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    /// Set the compaction threshold
    pub fn compact_threshold(mut self, threshold: f64) -> Self {
        self.compact_threshold = threshold;
        self
    }

    /// Parse a config from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: StoreConfig = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check that all values are usable
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(Error::InvalidConfig(format!(
                "page_size must be a power of two between {} and {}, got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }
        // Two header pages plus at least one catalog page.
        if self.max_pages < 4 {
            return Err(Error::InvalidConfig(format!(
                "max_pages must be at least 4, got {}",
                self.max_pages
            )));
        }
        if self.cache_pages == 0 {
            return Err(Error::InvalidConfig("cache_pages must be positive".into()));
        }
        if self.file_name.is_empty() || self.file_name.contains(['/', '\\']) {
            return Err(Error::InvalidConfig(format!(
                "file_name must be a plain file name, got '{}'",
                self.file_name
            )));
        }
        if !(0.0..=1.0).contains(&self.compact_threshold) {
            return Err(Error::InvalidConfig(format!(
                "compact_threshold must be within 0.0..=1.0, got {}",
                self.compact_threshold
            )));
        }
        Ok(())
    }
}
