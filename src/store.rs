//! Store handle for boxdb
//!
//! `Store` is the entry point of the library: it opens (or creates) a store
//! in a directory, reconciles the supplied schema with the persisted one,
//! and hands out transactions and boxes. Cloning a `Store` is cheap; all
//! clones share one transaction manager.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::catalog::Schema;
use crate::config::StoreConfig;
use crate::entity_box::{EntityBox, Persistable, TypedBox};
use crate::error::{Error, Result};
use crate::storage::pager::Pager;
use crate::transaction::{CompactionStats, ReadTxn, StoreStats, TransactionManager, WriteTxn};

/// An open store
#[derive(Debug, Clone)]
pub struct Store {
    manager: Arc<TransactionManager>,
}

impl Store {
    /// Open the store in `dir` with the default configuration, creating the
    /// directory and the store if needed
    pub fn open(dir: impl AsRef<Path>, schema: &Schema) -> Result<Self> {
        Self::open_with_config(dir, schema, StoreConfig::default())
    }

    /// Open the store in `dir` with an explicit configuration
    pub fn open_with_config(
        dir: impl AsRef<Path>,
        schema: &Schema,
        config: StoreConfig,
    ) -> Result<Self> {
        Self::open_dir(dir.as_ref(), config, Some(schema))
    }

    /// Open an existing store with its persisted schema
    pub fn open_existing(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        Self::open_dir(dir.as_ref(), config, None)
    }

    /// A store kept entirely in memory
    pub fn in_memory(schema: &Schema) -> Result<Self> {
        Self::in_memory_with_config(schema, StoreConfig::default())
    }

    pub fn in_memory_with_config(schema: &Schema, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let pager = Pager::memory(config.page_size);
        let manager = TransactionManager::open(pager, config, Some(schema))?;
        Ok(Self { manager })
    }

    fn open_dir(dir: &Path, config: StoreConfig, schema: Option<&Schema>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(dir).map_err(|source| Error::DirectoryUnavailable {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(&config.file_name);
        let pager = Pager::open(&path, config.page_size)?;
        let manager = TransactionManager::open(pager, config, schema)?;
        info!(path = %path.display(), version = manager.current().number, "store ready");
        Ok(Self { manager })
    }

    pub fn config(&self) -> &StoreConfig {
        self.manager.config()
    }

    /// Latest committed version number
    pub fn version(&self) -> u64 {
        self.manager.current().number
    }

    /// Schema as currently persisted, including ids assigned by the catalog
    pub fn schema(&self) -> Schema {
        self.manager.current().catalog.to_schema()
    }

    /// Describe one entity type
    pub fn type_info(&self, type_name: &str) -> Result<String> {
        self.manager.current().catalog.get_type_info(type_name)
    }

    /// Names of all entity types
    pub fn type_names(&self) -> Vec<String> {
        self.manager.current().catalog.list_types()
    }

    pub fn begin_read(&self) -> ReadTxn {
        self.manager.begin_read()
    }

    /// Fails with `TransactionAlreadyActive` if this thread holds one already
    pub fn begin_write(&self) -> Result<WriteTxn> {
        self.manager.begin_write()
    }

    pub fn run_in_read<R>(&self, f: impl FnOnce(&ReadTxn) -> Result<R>) -> Result<R> {
        self.manager.run_in_read(f)
    }

    /// Run `f` in a write transaction, retrying it on write conflicts
    pub fn run_in_write<R>(&self, f: impl FnMut(&mut WriteTxn) -> Result<R>) -> Result<R> {
        self.manager.run_in_write(f)
    }

    /// Standalone box of one entity type
    pub fn entity_box(&self, type_name: &str) -> Result<EntityBox> {
        EntityBox::new(Arc::clone(&self.manager), type_name)
    }

    pub fn typed_box<T: Persistable>(&self) -> Result<TypedBox<T>> {
        TypedBox::new(Arc::clone(&self.manager))
    }

    /// Rewrite sparse data pages using the configured threshold
    pub fn compact(&self) -> Result<CompactionStats> {
        self.manager.compact(self.manager.config().compact_threshold)
    }

    pub fn compact_with_threshold(&self, threshold: f64) -> Result<CompactionStats> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidConfig(format!(
                "compact threshold must be within 0.0..=1.0, got {}",
                threshold
            )));
        }
        self.manager.compact(threshold)
    }

    pub fn stats(&self) -> StoreStats {
        self.manager.stats()
    }
}
