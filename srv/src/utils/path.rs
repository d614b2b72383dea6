//! path utils

use std::path::{Path, PathBuf};

use crate::store::settings::{COMPACTION_FILE_SUFFIX, DATA_FILE_PREFIX};

/// What a file name in the store directory turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentName {
    /// `current-data{seq}`
    Data(u64),
    /// `current-data{seq}.compact`, left behind by an interrupted compaction.
    Compaction(u64),
}

pub fn parse_segment_name(path: &Path) -> Option<SegmentName> {
    let rest = path.file_name()?.to_str()?.strip_prefix(DATA_FILE_PREFIX)?;

    match rest.strip_suffix(COMPACTION_FILE_SUFFIX) {
        Some(seq) => parse_seq(seq).map(SegmentName::Compaction),
        None => parse_seq(rest).map(SegmentName::Data),
    }
}

fn parse_seq(s: &str) -> Option<u64> {
    // `u64::from_str` accepts a leading '+', which no segment name has.
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

pub fn segment_file_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{}{}", DATA_FILE_PREFIX, seq))
}

pub fn compaction_file_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{}{}{}", DATA_FILE_PREFIX, seq, COMPACTION_FILE_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_parse_segment_names() {
        let dir = Path::new("/tmp/db");

        assert_eq!(
            parse_segment_name(&segment_file_path(dir, 0)),
            Some(SegmentName::Data(0))
        );
        assert_eq!(
            parse_segment_name(&segment_file_path(dir, 17)),
            Some(SegmentName::Data(17))
        );
        assert_eq!(
            parse_segment_name(&compaction_file_path(dir, 3)),
            Some(SegmentName::Compaction(3))
        );

        assert_eq!(parse_segment_name(&dir.join("LOCK")), None);
        assert_eq!(parse_segment_name(&dir.join("current-data")), None);
        assert_eq!(parse_segment_name(&dir.join("current-data+1")), None);
        assert_eq!(parse_segment_name(&dir.join("current-data1.tmp")), None);
    }
}
