//! Segment chain.
//!
//! Sealed segments in creation order, followed by the single active segment.
//! Lookups walk the chain from the active segment backwards, so the newest
//! record of a key always wins.

use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::{glob, Pattern};
use log::{info, trace, warn};

use super::error::{Result, StoreError};
use super::format::Entry;
use super::segment::{ActiveSegment, SealedSegment, SegmentFile};
use super::settings::DATA_FILE_PREFIX;
use crate::utils::path::{parse_segment_name, segment_file_path, SegmentName};

#[derive(Debug)]
pub struct SegmentChain {
    /// directory holding the segment files.
    dir: PathBuf,

    /// immutable segments, oldest first.
    sealed: Vec<Arc<SealedSegment>>,

    /// the only writeable segment, always the tail of the chain.
    active: ActiveSegment,

    /// sequence number of the next segment to create.
    next_seq: u64,

    sync: bool,
}

impl SegmentChain {
    /// Open the chain stored in `dir`, replaying every segment file.
    ///
    /// The newest file becomes the active segment; an empty directory gets a
    /// fresh `current-data0`.
    pub fn open(dir: &Path, sync: bool) -> Result<Self> {
        let mut data_files = list_data_files(dir)?;

        let (last_seq, last_path) = match data_files.pop() {
            Some(last) => last,
            None => {
                info!("no segments in {}, starting a new chain", dir.display());
                let active = ActiveSegment::create(segment_file_path(dir, 0), 0, sync)?;
                return Ok(Self {
                    dir: dir.to_path_buf(),
                    sealed: Vec::new(),
                    active,
                    next_seq: 1,
                    sync,
                });
            }
        };

        let mut sealed = Vec::with_capacity(data_files.len());
        for (seq, path) in data_files {
            let segment = SealedSegment::recover(SegmentFile::open(&path, seq)?)?;
            sealed.push(Arc::new(segment));
        }
        let active = ActiveSegment::recover(SegmentFile::open(&last_path, last_seq)?, sync)?;

        info!(
            "recovered {} segments from {}, active segment {} holds {} bytes",
            sealed.len() + 1,
            dir.display(),
            active.path().display(),
            active.size()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            sealed,
            active,
            next_seq: last_seq + 1,
            sync,
        })
    }

    /// Number of segments, the active one included.
    pub fn len(&self) -> usize {
        self.sealed.len() + 1
    }

    pub fn sealed(&self) -> &[Arc<SealedSegment>] {
        &self.sealed
    }

    pub fn active(&self) -> &ActiveSegment {
        &self.active
    }

    /// Paths of all segment files, oldest first.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.sealed
            .iter()
            .map(|s| s.path().to_path_buf())
            .chain(std::iter::once(self.active.path().to_path_buf()))
            .collect()
    }

    /// Find the newest record of `key`.
    pub fn resolve(&self, key: &str) -> Option<(Arc<SegmentFile>, u64)> {
        self.active
            .lookup(key)
            .or_else(|| self.sealed.iter().rev().find_map(|s| s.lookup(key)))
    }

    /// Rotate if a record of `record_size` bytes would push the active
    /// segment past `segment_size`. Returns `true` if a rotation happened.
    pub fn rotate_if_full(&mut self, record_size: u64, segment_size: u64) -> Result<bool> {
        // an oversized record still goes into an empty segment on its own.
        let rotate = !self.active.is_empty() && self.active.size() + record_size > segment_size;
        if rotate {
            self.rotate()?;
        }
        Ok(rotate)
    }

    /// Append `entry` to the active segment. Returns its offset.
    pub fn append(&mut self, entry: Entry) -> Result<u64> {
        self.active.append(entry)
    }

    /// Seal the active segment and start a new one.
    pub fn rotate(&mut self) -> Result<()> {
        self.active.sync()?;
        let sealed_size = self.active.size();

        let seq = self.next_seq;
        let next = ActiveSegment::create(segment_file_path(&self.dir, seq), seq, self.sync)?;
        self.next_seq += 1;

        let sealed = mem::replace(&mut self.active, next).seal();
        info!(
            "segment `{}` sealed at {} bytes, switched to `{}`",
            sealed.path().display(),
            sealed_size,
            self.active.path().display()
        );
        self.sealed.push(Arc::new(sealed));

        Ok(())
    }

    /// Swap the sealed prefix `merged` for the single `compacted` segment.
    ///
    /// Fails without touching the chain if the chain no longer starts with
    /// exactly the segments in `merged`.
    pub fn replace_prefix(
        &mut self,
        merged: &[Arc<SealedSegment>],
        compacted: SealedSegment,
    ) -> Result<()> {
        let unchanged = !merged.is_empty()
            && merged.len() <= self.sealed.len()
            && merged
                .iter()
                .zip(&self.sealed)
                .all(|(a, b)| Arc::ptr_eq(a, b));
        if !unchanged {
            return Err(StoreError::CompactionAborted(
                "segment chain changed during compaction".to_string(),
            ));
        }

        self.sealed
            .splice(..merged.len(), std::iter::once(Arc::new(compacted)));
        Ok(())
    }

    /// Flush the active segment to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.active.sync()
    }
}

/// Segment files in `dir`, sorted by sequence number. Leftovers of an
/// interrupted compaction are deleted on the way.
fn list_data_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let pattern = format!(
        "{}/{}*",
        Pattern::escape(&dir.to_string_lossy()),
        DATA_FILE_PREFIX
    );
    trace!("read segment files with pattern: {}", &pattern);

    let mut files = Vec::new();
    for path in glob(&pattern)? {
        let path = path?;
        match parse_segment_name(&path) {
            Some(SegmentName::Data(seq)) => files.push((seq, path)),
            Some(SegmentName::Compaction(_)) => {
                warn!("remove unfinished compaction file {}", path.display());
                fs::remove_file(&path).map_err(StoreError::file_io("remove", &path))?;
            }
            None => trace!("skip unrelated file {}", path.display()),
        }
    }
    files.sort_by_key(|(seq, _)| *seq);

    Ok(files)
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::utils::path::compaction_file_path;

    fn put(chain: &mut SegmentChain, key: &str, value: &str, segment_size: u64) -> bool {
        let entry = Entry::new(key, value);
        let rotated = chain.rotate_if_full(entry.size(), segment_size).unwrap();
        chain.append(entry).unwrap();
        rotated
    }

    fn fill(chain: &mut SegmentChain, pairs: &[(&str, &str)], segment_size: u64) {
        for (k, v) in pairs {
            put(chain, k, v, segment_size);
        }
    }

    fn value_of(chain: &SegmentChain, key: &str) -> Option<String> {
        chain
            .resolve(key)
            .map(|(file, offset)| file.read_at(offset).unwrap().value)
    }

    #[test]
    fn open_should_bootstrap_first_segment() {
        let dir = TempDir::new("chain-test").unwrap();
        let chain = SegmentChain::open(dir.path(), false).unwrap();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain.paths(), vec![dir.path().join("current-data0")]);
        assert!(dir.path().join("current-data0").exists());
    }

    #[test]
    fn append_should_rotate_past_segment_size() {
        let dir = TempDir::new("chain-test").unwrap();
        let mut chain = SegmentChain::open(dir.path(), false).unwrap();

        assert!(!put(&mut chain, "key1", "value1", 45));
        assert!(!put(&mut chain, "key2", "value2", 45));
        assert!(put(&mut chain, "key3", "value3", 45));
        assert!(!put(&mut chain, "key2", "value5", 45));

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.active().seq(), 1);
        assert_eq!(value_of(&chain, "key1").as_deref(), Some("value1"));
        assert_eq!(value_of(&chain, "key2").as_deref(), Some("value5"));
        assert_eq!(value_of(&chain, "nope"), None);
    }

    #[test]
    fn rotate_if_full_should_seal_before_append() {
        let dir = TempDir::new("chain-test").unwrap();
        let mut chain = SegmentChain::open(dir.path(), false).unwrap();
        put(&mut chain, "key1", "value1", 45);
        put(&mut chain, "key2", "value2", 45);

        assert!(chain.rotate_if_full(22, 45).unwrap());
        assert_eq!(chain.len(), 2);
        assert!(chain.active().is_empty());
        assert_eq!(chain.sealed()[0].keydir().len(), 2);

        // an empty active segment takes the record without rotating again.
        assert!(!chain.rotate_if_full(22, 45).unwrap());
    }

    #[test]
    fn oversized_record_should_not_rotate_empty_segment() {
        let dir = TempDir::new("chain-test").unwrap();
        let mut chain = SegmentChain::open(dir.path(), false).unwrap();

        assert!(!put(&mut chain, "big", &"x".repeat(100), 10));
        assert!(put(&mut chain, "small", "y", 10));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn open_should_recover_every_segment() {
        let dir = TempDir::new("chain-test").unwrap();
        {
            let mut chain = SegmentChain::open(dir.path(), false).unwrap();
            fill(
                &mut chain,
                &[
                    ("key1", "value1"),
                    ("key2", "value2"),
                    ("key3", "value3"),
                    ("key2", "value5"),
                    ("key4", "value4"),
                ],
                45,
            );
            assert_eq!(chain.len(), 3);
        }

        let mut chain = SegmentChain::open(dir.path(), false).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.active().seq(), 2);
        assert_eq!(value_of(&chain, "key1").as_deref(), Some("value1"));
        assert_eq!(value_of(&chain, "key2").as_deref(), Some("value5"));
        assert_eq!(value_of(&chain, "key4").as_deref(), Some("value4"));

        // new segments keep counting from the highest one on disk.
        chain.rotate().unwrap();
        assert_eq!(chain.active().seq(), 3);
    }

    #[test]
    fn open_should_remove_unfinished_compaction() {
        let dir = TempDir::new("chain-test").unwrap();
        let leftover = compaction_file_path(dir.path(), 0);
        fs::write(&leftover, b"half written").unwrap();
        fs::write(dir.path().join("unrelated"), b"keep").unwrap();

        let chain = SegmentChain::open(dir.path(), false).unwrap();
        assert_eq!(chain.len(), 1);
        assert!(!leftover.exists());
        assert!(dir.path().join("unrelated").exists());
    }

    #[test]
    fn replace_prefix_should_reject_foreign_snapshot() {
        let dir = TempDir::new("chain-test").unwrap();
        let mut chain = SegmentChain::open(dir.path(), false).unwrap();
        fill(&mut chain, &[("a", "1"), ("b", "2"), ("c", "3")], 20);
        assert_eq!(chain.len(), 3);

        let other = TempDir::new("chain-test").unwrap();
        let mut foreign =
            ActiveSegment::create(segment_file_path(other.path(), 0), 0, false).unwrap();
        foreign.append(Entry::new("z", "26")).unwrap();
        let snapshot = vec![Arc::new(foreign.seal())];

        let replacement = ActiveSegment::create(segment_file_path(other.path(), 1), 1, false)
            .unwrap()
            .seal();
        let res = chain.replace_prefix(&snapshot, replacement);
        assert!(matches!(res, Err(StoreError::CompactionAborted(_))));
        assert_eq!(chain.len(), 3);
    }
}
