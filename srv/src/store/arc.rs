//! Arc Store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use super::compaction::CompactionReport;
use super::error::Result;
use super::storage::{DiskStorage, Storage};
use super::StoreOptions;

/// Build custom open options.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions(StoreOptions);

impl OpenOptions {
    pub fn new() -> Self {
        Self(StoreOptions::default())
    }

    pub fn segment_size_bytes(mut self, value: u64) -> Self {
        self.0.segment_size_bytes = value;
        self
    }

    pub fn compaction_threshold(mut self, value: usize) -> Self {
        self.0.compaction_threshold = value;
        self
    }

    pub fn sync(mut self, value: bool) -> Self {
        self.0.sync = value;
        self
    }

    pub fn max_value_size(mut self, value: u64) -> Self {
        self.0.max_value_size = value;
        self
    }

    pub fn max_key_size(mut self, value: u64) -> Self {
        self.0.max_key_size = value;
        self
    }

    pub fn open(&self, path: impl AsRef<Path>) -> Result<Store> {
        Store::open_with_options(path, self.0)
    }
}

/// Store handler for multiple threads.
///
/// Clones share one open store; the directory stays locked until the
/// last clone and the last running compaction are gone.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<DiskStorage>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, opts: StoreOptions) -> Result<Self> {
        let store = Self {
            inner: Arc::new(DiskStorage::open_with_options(path, opts)?),
        };

        if store.inner.compact_if_needed()? {
            info!(
                "segment chain of {} is over the threshold, compacting",
                store.path().display()
            );
        }

        Ok(store)
    }

    pub fn path(&self) -> PathBuf {
        self.inner.path().to_path_buf()
    }

    /// Merge the sealed segments in the background.
    /// Returns `false` if there was nothing to start.
    pub fn compact(&self) -> Result<bool> {
        self.inner.compact()
    }

    /// Block until all compactions started so far are finished.
    pub fn wait_for_compaction(&self) -> Result<Option<CompactionReport>> {
        self.inner.wait_for_compaction()
    }

    pub fn segment_count(&self) -> Result<usize> {
        self.inner.segment_count()
    }

    pub fn active_segment_size(&self) -> Result<u64> {
        self.inner.active_segment_size()
    }

    pub fn segment_paths(&self) -> Result<Vec<PathBuf>> {
        self.inner.segment_paths()
    }
}

impl Storage for Store {
    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.inner.put(key, value)
    }

    fn get(&self, key: &str) -> Result<String> {
        self.inner.get(key)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
