//! Store Error Module.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    /// File level I/O failure, with enough context to find the culprit.
    #[error("failed to {op} '{}': {source}", .path.display())]
    FileIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt record in '{}' at offset {offset}: {reason}", .path.display())]
    CorruptRecord {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("key '{0}' not found")]
    KeyNotFound(String),

    #[error("key must not be empty")]
    EmptyKey,

    #[error("key is too large")]
    KeyIsTooLarge,

    #[error("value is too large")]
    ValueIsTooLarge,

    #[error("invalid store options: {0}")]
    InvalidOptions(String),

    #[error("db is already locked")]
    AlreadyLocked,

    #[error("store is closed")]
    Closed,

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("compaction aborted: {0}")]
    CompactionAborted(String),
}

impl StoreError {
    /// Wrap an `io::Error` with the operation and the file it hit.
    pub(crate) fn file_io<'a>(
        op: &'static str,
        path: &'a Path,
    ) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| StoreError::FileIo {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupt(path: &Path, offset: u64, reason: impl ToString) -> Self {
        StoreError::CorruptRecord {
            path: path.to_path_buf(),
            offset,
            reason: reason.to_string(),
        }
    }

    /// `true` for errors that come from a bad request rather than the store.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            StoreError::EmptyKey | StoreError::KeyIsTooLarge | StoreError::ValueIsTooLarge
        )
    }
}
