//! Keydir implementation.
//!
//! Keydir is the in-memory index of a single segment: it maps every key
//! the segment holds to the byte offset of its most recent record.

use std::collections::hash_map::{HashMap, Iter};

#[derive(Debug, Default, Clone)]
pub struct Keydir {
    /// mapping from a key to its record offset.
    mapping: HashMap<String, u64>,
}

impl Keydir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the latest record for `key`.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.mapping.get(key).copied()
    }

    /// Point `key` at `offset`, returning the offset it replaced.
    pub fn put(&mut self, key: String, offset: u64) -> Option<u64> {
        self.mapping.insert(key, offset)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.mapping.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, String, u64> {
        self.mapping.iter()
    }
}
