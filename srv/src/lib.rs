//! Segmented append-only key value store with background compaction.

pub mod api;
pub mod store;
pub mod utils;
