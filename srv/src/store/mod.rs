//! Store Module.

pub mod arc;
pub mod compaction;
pub mod error;
pub mod format;
pub mod keydir;
pub mod segment;
pub mod settings;
pub mod storage;

mod chain;
mod lockfile;

use error::{Result, StoreError};

#[derive(Debug, Copy, Clone)]
pub struct StoreOptions {
    /// the active segment is sealed once the next record would push it
    /// past this size.
    pub(crate) segment_size_bytes: u64,

    /// sealed segments are merged once the chain grows to this many
    /// segments, the active one included.
    pub(crate) compaction_threshold: usize,

    // sync data to storage after each writting operation.
    // we should balance data reliability and writting performance.
    pub(crate) sync: bool,

    pub(crate) max_key_size: u64,

    pub(crate) max_value_size: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            segment_size_bytes: settings::DEFAULT_SEGMENT_SIZE, // 10MB
            compaction_threshold: settings::DEFAULT_COMPACTION_THRESHOLD,
            sync: false,
            max_key_size: settings::DEFAULT_MAX_KEY_SIZE,
            max_value_size: settings::DEFAULT_MAX_VALUE_SIZE,
        }
    }
}

impl StoreOptions {
    pub fn validate(&self) -> Result<()> {
        if self.segment_size_bytes == 0 {
            return Err(StoreError::InvalidOptions(
                "segment size must be positive".to_string(),
            ));
        }

        if self.compaction_threshold < 2 {
            return Err(StoreError::InvalidOptions(format!(
                "compaction threshold must be at least 2, got {}",
                self.compaction_threshold
            )));
        }

        if self.max_key_size == 0 {
            return Err(StoreError::InvalidOptions(
                "max key size must be positive".to_string(),
            ));
        }

        // both lengths and the fields after the size prefix must fit in it.
        let max_body = self
            .max_key_size
            .saturating_add(self.max_value_size)
            .saturating_add(format::MIN_BODY_SIZE as u64);
        if max_body > u32::MAX as u64 {
            return Err(StoreError::InvalidOptions(format!(
                "max key size {} plus max value size {} overflow the record size field",
                self.max_key_size, self.max_value_size
            )));
        }

        Ok(())
    }
}

pub use arc::{OpenOptions, Store};
pub use compaction::{CompactionHandle, CompactionReport};
pub use storage::Storage;
