//! Segment Module.
//!
//! A segment is one append-only data file plus the keydir for it. The
//! active segment is the only one that accepts appends; sealing consumes it
//! and hands back a [`SealedSegment`], which has no way to write.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, trace, warn};

use super::error::{Result, StoreError};
use super::format::{self, Entry, LEN_SIZE, MIN_BODY_SIZE};
use super::keydir::Keydir;

/// Shared read handle of a segment file.
///
/// Reads are positional, so one handle serves any number of threads and
/// stays valid after the path is renamed over or unlinked.
#[derive(Debug)]
pub struct SegmentFile {
    seq: u64,
    path: PathBuf,
    file: File,
}

impl SegmentFile {
    pub fn open(path: impl AsRef<Path>, seq: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(StoreError::file_io("open", path))?;

        Ok(Self {
            seq,
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length.
    pub fn len(&self) -> Result<u64> {
        let meta = self
            .file
            .metadata()
            .map_err(StoreError::file_io("stat", &self.path))?;
        Ok(meta.len())
    }

    /// Decode the record starting at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<Entry> {
        trace!("read record at offset {} in {}", offset, self.path.display());

        let len = self.len()?;
        let remaining = len.saturating_sub(offset);
        if remaining < LEN_SIZE as u64 {
            return Err(StoreError::corrupt(
                &self.path,
                offset,
                format!("no record header, file is {} bytes", len),
            ));
        }

        let mut prefix = [0u8; LEN_SIZE];
        self.read_exact_at(&mut prefix, offset)?;

        let body_size = format::body_size(prefix) as u64;
        if body_size > remaining - LEN_SIZE as u64 {
            return Err(StoreError::corrupt(
                &self.path,
                offset,
                format!(
                    "declared size {} exceeds the {} bytes left in the file",
                    body_size,
                    remaining - LEN_SIZE as u64
                ),
            ));
        }

        let mut buf = vec![0u8; LEN_SIZE + body_size as usize];
        buf[..LEN_SIZE].copy_from_slice(&prefix);
        self.read_exact_at(&mut buf[LEN_SIZE..], offset + LEN_SIZE as u64)?;

        Entry::decode(&buf).map_err(|e| StoreError::corrupt(&self.path, offset, e))
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        read_exact_at(&self.file, buf, offset).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StoreError::corrupt(&self.path, offset, "record cut short")
            } else {
                StoreError::file_io("read", &self.path)(e)
            }
        })
    }

    /// Scan the whole file from the start and rebuild its keydir.
    ///
    /// A partial record at the very end is the trace of a crash in the
    /// middle of an append and ends the scan; a record that does not decode
    /// is `CorruptRecord`.
    pub fn replay(&self) -> Result<Replay> {
        let file = File::open(&self.path).map_err(StoreError::file_io("open", &self.path))?;
        let file_len = self.len()?;
        let mut reader = BufReader::new(file);

        let mut keydir = Keydir::new();
        let mut offset = 0u64;
        let mut records = 0u64;

        loop {
            let mut prefix = [0u8; LEN_SIZE];
            let n = read_full(&mut reader, &mut prefix)
                .map_err(StoreError::file_io("read", &self.path))?;
            if n < LEN_SIZE {
                break;
            }

            let body_size = format::body_size(prefix);
            if body_size < MIN_BODY_SIZE {
                return Err(StoreError::corrupt(
                    &self.path,
                    offset,
                    format!("declared size {} is below the minimum", body_size),
                ));
            }
            if body_size as u64 > file_len.saturating_sub(offset + LEN_SIZE as u64) {
                break;
            }

            let mut buf = vec![0u8; LEN_SIZE + body_size as usize];
            buf[..LEN_SIZE].copy_from_slice(&prefix);
            let n = read_full(&mut reader, &mut buf[LEN_SIZE..])
                .map_err(StoreError::file_io("read", &self.path))?;
            if n < body_size as usize {
                break;
            }

            let entry =
                Entry::decode(&buf).map_err(|e| StoreError::corrupt(&self.path, offset, e))?;
            keydir.put(entry.key, offset);

            offset += buf.len() as u64;
            records += 1;
        }

        debug!(
            "replayed {} records ({} keys) from {}",
            records,
            keydir.len(),
            self.path.display()
        );

        Ok(Replay {
            keydir,
            valid_len: offset,
            file_len,
        })
    }
}

/// Outcome of replaying one segment file.
#[derive(Debug)]
pub struct Replay {
    pub keydir: Keydir,

    /// length of the prefix made of whole records.
    pub valid_len: u64,

    pub file_len: u64,
}

impl Replay {
    /// Bytes of a torn final record, if any.
    pub fn torn_bytes(&self) -> u64 {
        self.file_len - self.valid_len
    }
}

/// The segment currently accepting writes.
#[derive(Debug)]
pub struct ActiveSegment {
    file: Arc<SegmentFile>,

    /// append-only write handle.
    writer: File,

    write_offset: u64,

    keydir: Keydir,

    /// fsync every append before acknowledging it.
    sync: bool,
}

impl ActiveSegment {
    /// Create a new, empty segment file at `path`.
    pub fn create(path: impl AsRef<Path>, seq: u64, sync: bool) -> Result<Self> {
        let path = path.as_ref();
        debug!("new segment file at: {}", path.display());

        let writer = fs::OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)
            .map_err(StoreError::file_io("create", path))?;
        let file = SegmentFile::open(path, seq)?;

        Ok(Self {
            file: Arc::new(file),
            writer,
            write_offset: 0,
            keydir: Keydir::new(),
            sync,
        })
    }

    /// Reopen an existing segment for appending, dropping a torn tail.
    pub fn recover(file: SegmentFile, sync: bool) -> Result<Self> {
        let replay = file.replay()?;

        let writer = fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .map_err(StoreError::file_io("open", file.path()))?;

        if replay.torn_bytes() > 0 {
            warn!(
                "dropping {} bytes of a torn record at the end of {}",
                replay.torn_bytes(),
                file.path().display()
            );
            writer
                .set_len(replay.valid_len)
                .map_err(StoreError::file_io("truncate", file.path()))?;
            writer
                .sync_all()
                .map_err(StoreError::file_io("sync", file.path()))?;
        }

        Ok(Self {
            file: Arc::new(file),
            writer,
            write_offset: replay.valid_len,
            keydir: replay.keydir,
            sync,
        })
    }

    pub fn seq(&self) -> u64 {
        self.file.seq()
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.write_offset
    }

    pub fn is_empty(&self) -> bool {
        self.write_offset == 0
    }

    pub fn keydir(&self) -> &Keydir {
        &self.keydir
    }

    pub fn lookup(&self, key: &str) -> Option<(Arc<SegmentFile>, u64)> {
        self.keydir
            .get(key)
            .map(|offset| (Arc::clone(&self.file), offset))
    }

    /// Append `entry` and index it. Returns the offset of the record.
    pub fn append(&mut self, entry: Entry) -> Result<u64> {
        let offset = self.write_offset;
        let buf = entry.encode();

        if let Err(e) = self.write_record(&buf) {
            // never leave part of a record in front of later appends.
            if let Err(te) = self.writer.set_len(offset) {
                error!(
                    "failed to roll back {} to {} bytes: {}",
                    self.path().display(),
                    offset,
                    te
                );
            }
            return Err(StoreError::file_io("append to", self.file.path())(e));
        }

        trace!(
            "append {} at offset {} of {}",
            &entry,
            offset,
            self.path().display()
        );

        self.write_offset += buf.len() as u64;
        self.keydir.put(entry.key, offset);

        Ok(offset)
    }

    fn write_record(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writer.write_all(buf)?;
        if self.sync {
            self.writer.sync_data()?;
        }
        Ok(())
    }

    /// Flush all pending writes to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.writer
            .sync_all()
            .map_err(StoreError::file_io("sync", self.file.path()))
    }

    /// Stop accepting writes. The file and keydir are frozen from here on.
    pub fn seal(self) -> SealedSegment {
        SealedSegment {
            file: self.file,
            keydir: self.keydir,
        }
    }
}

/// An immutable segment.
#[derive(Debug)]
pub struct SealedSegment {
    file: Arc<SegmentFile>,
    keydir: Keydir,
}

impl SealedSegment {
    pub fn new(file: SegmentFile, keydir: Keydir) -> Self {
        Self {
            file: Arc::new(file),
            keydir,
        }
    }

    /// Rebuild a sealed segment from its file.
    pub fn recover(file: SegmentFile) -> Result<Self> {
        let replay = file.replay()?;
        if replay.torn_bytes() > 0 {
            warn!(
                "ignoring {} bytes of a torn record at the end of sealed segment {}",
                replay.torn_bytes(),
                file.path().display()
            );
        }
        Ok(Self::new(file, replay.keydir))
    }

    pub fn seq(&self) -> u64 {
        self.file.seq()
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn file(&self) -> &Arc<SegmentFile> {
        &self.file
    }

    pub fn keydir(&self) -> &Keydir {
        &self.keydir
    }

    pub fn lookup(&self, key: &str) -> Option<(Arc<SegmentFile>, u64)> {
        self.keydir
            .get(key)
            .map(|offset| (Arc::clone(&self.file), offset))
    }
}

/// Read into `buf` until it is full or the reader is exhausted.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
