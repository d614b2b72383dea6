//! Disk storage: the segment chain behind one lock, plus background compaction.

use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::{error, info, trace};

use super::chain::SegmentChain;
use super::compaction::{self, CompactionHandle, CompactionReport};
use super::error::{Result, StoreError};
use super::format::Entry;
use super::lockfile::Lockfile;
use super::segment::SealedSegment;
use super::settings;
use super::StoreOptions;

/// What the outside world needs from a key value store.
pub trait Storage {
    /// Set key and value to store.
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Get value by key from the store, `KeyNotFound` if it was never set.
    fn get(&self, key: &str) -> Result<String>;

    /// Wait for background work and flush all pending writes.
    fn close(&self) -> Result<()>;
}

/// Everything guarded by the store lock.
///
/// Every index update, lookup and chain swap happens while holding it, so
/// they are totally ordered. Reads from sealed segments happen after it is
/// released.
#[derive(Debug)]
struct State {
    chain: SegmentChain,

    /// a compaction snapshot is out and has not been swapped in yet.
    compacting: bool,

    closed: bool,
}

impl State {
    /// Hand out the current sealed segments for merging, unless a
    /// compaction is already running.
    fn begin_compaction(&mut self) -> Option<Vec<Arc<SealedSegment>>> {
        if self.compacting || self.chain.sealed().is_empty() {
            return None;
        }
        self.compacting = true;
        Some(self.chain.sealed().to_vec())
    }
}

/// Disk storage.
#[derive(Debug)]
pub struct DiskStorage {
    /// directory for database.
    path: PathBuf,

    /// lock for database directory.
    _lock: Lockfile,

    state: Mutex<State>,

    /// background compactions not yet waited for.
    compactions: Mutex<Vec<CompactionHandle>>,

    /// store options.
    opts: StoreOptions,
}

impl DiskStorage {
    /// Open datastore directory with custom options.
    /// If the given path not found, a new one will be created.
    pub fn open_with_options(path: impl AsRef<Path>, opts: StoreOptions) -> Result<Self> {
        opts.validate()?;
        let path = path.as_ref();

        info!("open store path: {}", path.display());

        fs::create_dir_all(path)?;

        let lock = Lockfile::lock(path.join(settings::LOCK_FILE))?;
        let chain = SegmentChain::open(path, opts.sync)?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
            state: Mutex::new(State {
                chain,
                compacting: false,
                closed: false,
            }),
            compactions: Mutex::new(Vec::new()),
            opts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn open_state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state()?;
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state)
    }

    fn check_entry(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }

        if key.len() as u64 > self.opts.max_key_size {
            return Err(StoreError::KeyIsTooLarge);
        }

        if value.len() as u64 > self.opts.max_value_size {
            return Err(StoreError::ValueIsTooLarge);
        }

        Ok(())
    }

    /// Append the record and index it. Returns once both are done.
    pub fn put(self: &Arc<Self>, key: &str, value: &str) -> Result<()> {
        self.check_entry(key, value)?;
        let entry = Entry::new(key, value);

        let mut state = self.open_state()?;
        let rotated = state
            .chain
            .rotate_if_full(entry.size(), self.opts.segment_size_bytes)?;

        // scheduled before the append, so a failed append cannot lose it.
        if rotated && state.chain.len() >= self.opts.compaction_threshold {
            // a compaction that cannot start is retried on the next rotation.
            if let Err(e) = self.start_compaction(&mut state) {
                error!("failed to start compaction: {}", e);
            }
        }

        state.chain.append(entry)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<String> {
        let location = self.open_state()?.chain.resolve(key);

        let (file, offset) = location.ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        trace!(
            "found key `{}` at offset {} of {}",
            key,
            offset,
            file.path().display()
        );

        let entry = file.read_at(offset)?;
        if entry.key != key {
            return Err(StoreError::corrupt(
                file.path(),
                offset,
                format!("expected key '{}', found '{}'", key, entry.key),
            ));
        }

        Ok(entry.value)
    }

    /// Merge all sealed segments in the background.
    /// Returns `false` if there is nothing to merge or a merge is running.
    pub fn compact(self: &Arc<Self>) -> Result<bool> {
        let mut state = self.open_state()?;
        self.start_compaction(&mut state)
    }

    /// Start a compaction if the chain is already at the threshold, e.g.
    /// after recovering from a crash in the middle of one.
    pub(crate) fn compact_if_needed(self: &Arc<Self>) -> Result<bool> {
        let mut state = self.open_state()?;
        if state.chain.len() >= self.opts.compaction_threshold {
            self.start_compaction(&mut state)
        } else {
            Ok(false)
        }
    }

    /// Snapshot the sealed segments and merge them on a background thread.
    ///
    /// Runs under the store lock, so the handle is registered before `close`
    /// can look for it. Lock order is `state`, then `compactions`.
    fn start_compaction(self: &Arc<Self>, state: &mut State) -> Result<bool> {
        let snapshot = match state.begin_compaction() {
            Some(snapshot) => snapshot,
            None => return Ok(false),
        };

        let store = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("segdb-compactor".to_string())
            .spawn(move || {
                let res = store.run_compaction(snapshot);
                if let Err(e) = &res {
                    error!("compaction of {} failed: {}", store.path.display(), e);
                }
                res
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                state.compacting = false;
                return Err(StoreError::Io(e));
            }
        };

        let mut pending = self
            .compactions
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        pending.retain(|h| !h.is_finished());
        pending.push(CompactionHandle::new(handle));

        Ok(true)
    }

    fn run_compaction(&self, snapshot: Vec<Arc<SealedSegment>>) -> Result<CompactionReport> {
        info!(
            "compacting {} sealed segments in {}",
            snapshot.len(),
            self.path.display()
        );

        let merged = compaction::merge(&self.path, &snapshot);

        let swapped = {
            let mut state = self.state()?;
            state.compacting = false;
            merged.and_then(|compacted| {
                state.chain.replace_prefix(&snapshot, compacted.segment)?;
                Ok(compacted.report)
            })
        };
        let report = swapped?;

        // the newest merged file was replaced in place by the rename.
        for stale in &snapshot[..snapshot.len() - 1] {
            info!("remove stale segment file {}", stale.path().display());
            if let Err(e) = fs::remove_file(stale.path()) {
                error!(
                    "failed to remove stale segment file {}: {}",
                    stale.path().display(),
                    e
                );
            }
        }

        info!(
            "compaction done: {} segments merged into {} keys, {} bytes",
            report.merged_segments, report.live_keys, report.bytes_written
        );

        Ok(report)
    }

    /// Wait for every compaction started so far.
    /// Returns the report of the last one, if there was any, or the first
    /// failure once all of them are done.
    pub fn wait_for_compaction(&self) -> Result<Option<CompactionReport>> {
        let handles = mem::take(
            &mut *self
                .compactions
                .lock()
                .map_err(|_| StoreError::LockPoisoned)?,
        );

        let mut last = Ok(None);
        for handle in handles {
            let res = handle.wait();
            if last.is_ok() {
                last = res.map(Some);
            }
        }
        last
    }

    /// Number of segments in the chain, the active one included.
    pub fn segment_count(&self) -> Result<usize> {
        Ok(self.state()?.chain.len())
    }

    pub fn active_segment_size(&self) -> Result<u64> {
        Ok(self.state()?.chain.active().size())
    }

    /// Segment file paths, oldest first.
    pub fn segment_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self.state()?.chain.paths())
    }

    /// Force flushing any pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.state()?.chain.sync()
    }

    /// Stop accepting requests, let running compactions finish and flush
    /// the active segment. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state()?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        info!("closing store {}", self.path.display());
        let compacted = self.wait_for_compaction();
        self.sync()?;
        compacted.map(|_| ())
    }
}

impl Drop for DiskStorage {
    fn drop(&mut self) {
        trace!("sync all pending writes to disk.");
        match self.state.get_mut() {
            Ok(state) => {
                if let Err(e) = state.chain.sync() {
                    error!("failed to sync {}: {}", self.path.display(), e);
                }
            }
            Err(_) => error!("store lock poisoned, skip final sync"),
        }
    }
}
