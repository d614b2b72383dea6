//! Compaction Module.
//!
//! Merges a run of sealed segments into one, keeping only the newest
//! record of every key. The merged file is first written next to the
//! segments as `current-data{N}.compact` and then renamed over the newest
//! merged segment `current-data{N}`, so file names keep matching creation
//! order and a crash at any point leaves a chain that replays correctly.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};

use super::error::{Result, StoreError};
use super::keydir::Keydir;
use super::segment::{SealedSegment, SegmentFile};
use crate::utils::path::{compaction_file_path, segment_file_path};

/// Summary of one finished compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// number of sealed segments replaced.
    pub merged_segments: usize,

    /// keys written to the compacted segment.
    pub live_keys: usize,

    /// size of the compacted segment.
    pub bytes_written: u64,
}

/// Handle of a compaction running in the background.
#[derive(Debug)]
pub struct CompactionHandle {
    handle: JoinHandle<Result<CompactionReport>>,
}

impl CompactionHandle {
    pub(crate) fn new(handle: JoinHandle<Result<CompactionReport>>) -> Self {
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the compaction is done and return its outcome.
    pub fn wait(self) -> Result<CompactionReport> {
        self.handle.join().map_err(|_| {
            StoreError::CompactionAborted("compaction thread panicked".to_string())
        })?
    }
}

/// A merged segment, not yet swapped into the chain.
#[derive(Debug)]
pub struct Compacted {
    pub segment: SealedSegment,
    pub report: CompactionReport,
}

/// Merge `segments` (oldest first) into a single sealed segment that takes
/// over the sequence number and file name of the newest of them.
pub fn merge(dir: &Path, segments: &[Arc<SealedSegment>]) -> Result<Compacted> {
    let newest = segments.last().ok_or_else(|| {
        StoreError::CompactionAborted("no sealed segments to merge".to_string())
    })?;
    let seq = newest.seq();
    let tmp_path = compaction_file_path(dir, seq);
    let final_path = segment_file_path(dir, seq);

    let written = write_merged(&tmp_path, segments).and_then(|merged| {
        fs::rename(&tmp_path, &final_path).map_err(StoreError::file_io("rename", &tmp_path))?;
        Ok(merged)
    });
    let (keydir, bytes_written) = match written {
        Ok(merged) => merged,
        Err(e) => {
            discard(&tmp_path);
            return Err(e);
        }
    };

    let report = CompactionReport {
        merged_segments: segments.len(),
        live_keys: keydir.len(),
        bytes_written,
    };
    let file = SegmentFile::open(&final_path, seq)?;

    Ok(Compacted {
        segment: SealedSegment::new(file, keydir),
        report,
    })
}

/// Copy the live records of `segments` into a new file at `path`.
fn write_merged(path: &Path, segments: &[Arc<SealedSegment>]) -> Result<(Keydir, u64)> {
    let file = File::create(path).map_err(StoreError::file_io("create", path))?;
    let mut writer = BufWriter::new(file);

    let mut keydir = Keydir::new();
    let mut offset = 0u64;

    for (i, segment) in segments.iter().enumerate() {
        let newer = &segments[i + 1..];

        // keep the write order inside each segment.
        let mut live: Vec<(&String, u64)> = segment
            .keydir()
            .iter()
            .filter(|(key, _)| !newer.iter().any(|s| s.keydir().contains_key(key)))
            .map(|(key, offset)| (key, *offset))
            .collect();
        live.sort_by_key(|(_, at)| *at);

        debug!(
            "copy {} of {} keys from {}",
            live.len(),
            segment.keydir().len(),
            segment.path().display()
        );

        for (key, at) in live {
            let entry = segment.file().read_at(at)?;
            if entry.key != *key {
                return Err(StoreError::corrupt(
                    segment.path(),
                    at,
                    format!("expected key '{}', found '{}'", key, entry.key),
                ));
            }

            let buf = entry.encode();
            writer
                .write_all(&buf)
                .map_err(StoreError::file_io("write", path))?;
            keydir.put(entry.key, offset);
            offset += buf.len() as u64;
        }
    }

    let file = writer
        .into_inner()
        .map_err(|e| StoreError::file_io("flush", path)(e.into_error()))?;
    file.sync_all().map_err(StoreError::file_io("sync", path))?;

    Ok((keydir, offset))
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "failed to remove unfinished compaction file {}: {}",
            path.display(),
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::store::format::Entry;
    use crate::store::segment::ActiveSegment;

    fn sealed(dir: &Path, seq: u64, pairs: &[(&str, &str)]) -> Arc<SealedSegment> {
        let mut seg = ActiveSegment::create(segment_file_path(dir, seq), seq, false).unwrap();
        for (k, v) in pairs {
            seg.append(Entry::new(*k, *v)).unwrap();
        }
        Arc::new(seg.seal())
    }

    fn value_of(segment: &SealedSegment, key: &str) -> Option<String> {
        segment
            .lookup(key)
            .map(|(file, offset)| file.read_at(offset).unwrap().value)
    }

    #[test]
    fn merge_should_keep_newest_values() {
        let dir = TempDir::new("compaction-test").unwrap();
        let segments = vec![
            sealed(dir.path(), 0, &[("key1", "value1"), ("key2", "value2")]),
            sealed(dir.path(), 1, &[("key3", "value3"), ("key2", "value5")]),
        ];

        let compacted = merge(dir.path(), &segments).unwrap();
        assert_eq!(
            compacted.report,
            CompactionReport {
                merged_segments: 2,
                live_keys: 3,
                bytes_written: 66,
            }
        );

        let seg = &compacted.segment;
        assert_eq!(seg.seq(), 1);
        assert_eq!(seg.path(), segment_file_path(dir.path(), 1));
        assert_eq!(fs::metadata(seg.path()).unwrap().len(), 66);
        assert_eq!(value_of(seg, "key1").as_deref(), Some("value1"));
        assert_eq!(value_of(seg, "key2").as_deref(), Some("value5"));
        assert_eq!(value_of(seg, "key3").as_deref(), Some("value3"));
        assert!(!compaction_file_path(dir.path(), 1).exists());

        // the segments being replaced still read from their own handles.
        assert_eq!(value_of(&segments[1], "key3").as_deref(), Some("value3"));
    }

    #[test]
    fn merge_should_drop_duplicates_inside_one_segment() {
        let dir = TempDir::new("compaction-test").unwrap();
        let segments = vec![sealed(
            dir.path(),
            5,
            &[("a", "1"), ("b", "2"), ("a", "3"), ("a", "4")],
        )];

        let compacted = merge(dir.path(), &segments).unwrap();
        assert_eq!(compacted.report.live_keys, 2);
        assert_eq!(value_of(&compacted.segment, "a").as_deref(), Some("4"));

        let replay = compacted.segment.file().replay().unwrap();
        assert_eq!(replay.keydir.len(), 2);
        assert_eq!(replay.valid_len, compacted.report.bytes_written);
    }

    #[test]
    fn merge_should_clean_up_after_failure() {
        let dir = TempDir::new("compaction-test").unwrap();
        let good = sealed(dir.path(), 0, &[("key1", "value1")]);

        // a segment whose file lost its contents behind the keydir's back.
        let broken = sealed(dir.path(), 1, &[("key2", "value2")]);
        File::create(segment_file_path(dir.path(), 1)).unwrap();
        let broken_path = segment_file_path(dir.path(), 1);

        let res = merge(dir.path(), &[good, broken]);
        assert!(
            matches!(res, Err(StoreError::CorruptRecord { .. })),
            "got {:?}",
            res
        );
        assert!(!compaction_file_path(dir.path(), 1).exists());
        assert!(broken_path.exists());
    }

    #[test]
    fn merge_requires_segments() {
        let dir = TempDir::new("compaction-test").unwrap();
        let res = merge(dir.path(), &[]);
        assert!(matches!(res, Err(StoreError::CompactionAborted(_))));
    }
}
