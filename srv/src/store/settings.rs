//! Default settings and on-disk names.

/// Every segment file starts with this prefix, followed by its sequence number.
pub const DATA_FILE_PREFIX: &str = "current-data";

/// Suffix of the temporary file a compaction writes before it is renamed.
pub const COMPACTION_FILE_SUFFIX: &str = ".compact";

pub const LOCK_FILE: &str = "LOCK";

pub const DEFAULT_SEGMENT_SIZE: u64 = 10 * 1024 * 1024; // 10MB

/// Chain length at which sealed segments get merged.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 3;

pub const DEFAULT_MAX_KEY_SIZE: u64 = 64 * 1024; // 64KB

pub const DEFAULT_MAX_VALUE_SIZE: u64 = 64 * 1024 * 1024; // 64MB
