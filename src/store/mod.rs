//! Store Module
//!
//! The public engine composing the segment manager and the index.
//!
//! ## Responsibilities
//! - Route put/get/delete through segments and index
//! - Checkpoint (sync): flush segments, persist index snapshot and manifest
//! - Rebuild the index on open (snapshot + replay, or full replay)
//! - Lifecycle guards: every operation on a closed store fails
//! - Reclaim space held by orphaned records (compaction)

mod compaction;
mod recovery;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::config::{Config, SyncPolicy};
use crate::error::{Result, SegKvError};
use crate::index::{hash_key, write_snapshot, Index, IndexEntry, Upsert};
use crate::manifest::{Checkpoint, StoreManifest, FORMAT_VERSION};
use crate::record::Record;
use crate::segment::{Segment, SegmentManager};

pub use compaction::CompactionStats;
pub use recovery::RecoveryResult;

/// Index snapshot file name inside the home directory
pub const SNAPSHOT_FILENAME: &str = "index.snapshot";

/// Manifest file name inside the home directory
pub const MANIFEST_FILENAME: &str = "store.meta";

/// An embedded segment-backed key-value store
///
/// ## Concurrency Model
///
/// - **Lifecycle** (`inner`): every operation holds a read lock for its whole
///   duration; `close`/`reopen` take the write lock, so they wait for
///   in-flight operations and nothing runs against a half-closed store.
///
/// - **Writes** (put/delete): any number run at once. Appends serialize inside
///   the active segment; index updates serialize per index shard, which is
///   where same-key puts are ordered. A key always resolves to the record
///   appended last.
///
/// - **Reads** (get): share index shard read locks and never wait on the
///   checkpoint gate, so a running `sync` does not stall them.
///
/// - **Checkpoint gate** (`write_gate`): writers hold it shared from append to
///   index update; `sync` holds it exclusively only while it captures the
///   checkpoint position and copies the index.
pub struct Store {
    config: Config,
    inner: RwLock<Option<StoreInner>>,
}

impl Store {
    /// Open or create a store with the given config
    ///
    /// On startup:
    /// 1. Validate config and create the home directory
    /// 2. Load the manifest (if any) and check the segment capacity
    /// 3. Reopen existing segments
    /// 4. Load the index snapshot and replay records after its checkpoint,
    ///    or replay every segment when there is no usable snapshot
    pub fn open(config: Config) -> Result<Self> {
        let inner = StoreInner::load(&config)?;
        Ok(Self {
            config,
            inner: RwLock::new(Some(inner)),
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified home directory and key-count hint
    pub fn open_path(path: &Path, initial_capacity: usize) -> Result<Self> {
        let config = Config::builder()
            .home_dir(path)
            .initial_capacity(initial_capacity)
            .build();
        Self::open(config)
    }

    /// Reopen a closed store; a no-op if it is already open
    pub fn reopen(&self) -> Result<()> {
        let mut guard = self.inner.write();
        if guard.is_none() {
            *guard = Some(StoreInner::load(&self.config)?);
        }
        Ok(())
    }

    /// Checkpoint and release all segment file handles
    ///
    /// Closing a closed store is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.write();
        let Some(inner) = guard.as_ref() else {
            return Ok(());
        };
        inner.sync()?;
        *guard = None;

        tracing::info!(home_dir = %self.config.home_dir.display(), "store closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Put a key-value pair
    ///
    /// Steps:
    /// 1. Frame the record
    /// 2. Append it to the active segment (rolling over if full)
    /// 3. Point the key's index entry at it; the old record becomes an orphan
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let record = Record::new(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value))?;
        self.with_inner(|inner| inner.put(&record))
    }

    /// Get a value by key; `Ok(None)` if it was never put or was deleted
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_inner(|inner| inner.get(key))
    }

    /// Delete a key, returning whether it was present
    ///
    /// Appends a tombstone so the deletion survives replay.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.with_inner(|inner| inner.delete(key))
    }

    /// Durability checkpoint
    ///
    /// Every put that returned before `sync` was called is durable once it
    /// returns.
    pub fn sync(&self) -> Result<()> {
        self.with_inner(|inner| inner.sync())
    }

    /// Rewrite sparsely populated sealed segments and delete them
    pub fn compact(&self) -> Result<CompactionStats> {
        self.with_inner(|inner| inner.compact())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Number of live keys
    pub fn len(&self) -> Result<usize> {
        self.with_inner(|inner| Ok(inner.index.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.with_inner(|inner| Ok(inner.index.is_empty()))
    }

    /// Number of segment files
    pub fn segment_count(&self) -> Result<usize> {
        self.with_inner(|inner| Ok(inner.manager.segment_count()))
    }

    /// What the last open had to do to rebuild the index
    pub fn recovery_result(&self) -> Result<RecoveryResult> {
        self.with_inner(|inner| Ok(inner.recovery.clone()))
    }

    /// Get the home directory path
    pub fn home_dir(&self) -> &Path {
        &self.config.home_dir
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn with_inner<T>(&self, f: impl FnOnce(&StoreInner) -> Result<T>) -> Result<T> {
        let guard = self.inner.read();
        match guard.as_ref() {
            Some(inner) => f(inner),
            None => Err(SegKvError::StoreClosed),
        }
    }
}

/// State of an open store
struct StoreInner {
    home_dir: PathBuf,
    sync_policy: SyncPolicy,
    initial_capacity: usize,
    compaction_threshold: f64,

    manager: SegmentManager,
    index: Index,

    /// Shared by writers, exclusive while a checkpoint is captured
    write_gate: RwLock<()>,
    /// One sync at a time
    sync_lock: Mutex<()>,
    /// One compaction at a time
    compaction_lock: Mutex<()>,
    writes_since_sync: AtomicUsize,

    recovery: RecoveryResult,
}

impl StoreInner {
    fn load(config: &Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.home_dir)?;

        let manifest = StoreManifest::load(&config.home_dir.join(MANIFEST_FILENAME))?;
        if let Some(manifest) = &manifest {
            if manifest.segment_capacity != config.segment_capacity {
                return Err(SegKvError::Config(format!(
                    "store was created with segment capacity {}, configured {}",
                    manifest.segment_capacity, config.segment_capacity
                )));
            }
        }

        let manager = SegmentManager::open(
            &config.home_dir,
            config.segment_capacity,
            Arc::clone(&config.segment_factory),
            manifest.as_ref().map_or(1, |m| m.next_segment_id),
        )?;

        let mut inner = Self {
            home_dir: config.home_dir.clone(),
            sync_policy: config.sync_policy,
            initial_capacity: config.initial_capacity,
            compaction_threshold: config.compaction_threshold,
            manager,
            index: Index::with_capacity(config.initial_capacity, config.index_shards),
            write_gate: RwLock::new(()),
            sync_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            writes_since_sync: AtomicUsize::new(0),
            recovery: RecoveryResult::default(),
        };
        inner.recovery = inner.recover(manifest.as_ref())?;

        tracing::info!(
            home_dir = %config.home_dir.display(),
            factory = config.segment_factory.name(),
            segments = inner.manager.segment_count(),
            keys = inner.index.len(),
            snapshot_loaded = inner.recovery.snapshot_loaded,
            records_replayed = inner.recovery.records_replayed,
            "store opened"
        );
        Ok(inner)
    }

    fn put(&self, record: &Record) -> Result<()> {
        let key_hash = hash_key(record.key());
        {
            let _gate = self.write_gate.read();
            let location = self.manager.append(record)?;
            let entry = IndexEntry::new(key_hash, location);

            let outcome = self
                .index
                .upsert(entry, |existing| self.key_matches(existing, record.key()))?;
            if let Upsert::Replaced(previous) = outcome {
                tracing::trace!(
                    segment_id = previous.segment_id,
                    offset = previous.offset,
                    "record orphaned by overwrite"
                );
            }
        }
        self.after_write()
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let found = self.locate(hash_key(key), key)?;
        Ok(found.and_then(|(_, record)| record.value().map(<[u8]>::to_vec)))
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let key_hash = hash_key(key);
        let removed = {
            let _gate = self.write_gate.read();
            if self.locate(key_hash, key)?.is_none() {
                return Ok(false);
            }

            let tombstone = Record::tombstone(Bytes::copy_from_slice(key))?;
            let location = self.manager.append(&tombstone)?;
            self.index
                .remove_matching(key_hash, (location.segment_id, location.offset), |existing| {
                    self.key_matches(existing, key)
                })?
                .is_some()
        };
        self.after_write()?;
        Ok(removed)
    }

    /// Checkpoint: capture position + index, flush, persist snapshot and manifest
    fn sync(&self) -> Result<()> {
        let _sync = self.sync_lock.lock();

        let (position, next_segment_id, entries) = {
            let _gate = self.write_gate.write();
            (
                self.manager.append_position(),
                self.manager.next_segment_id(),
                self.index.entries(),
            )
        };
        self.writes_since_sync.store(0, Ordering::Release);

        self.manager.flush_all()?;
        let snapshot_checksum = write_snapshot(&self.home_dir.join(SNAPSHOT_FILENAME), &entries)?;

        let checkpoint = Checkpoint {
            segment_id: position.0,
            offset: position.1,
        };
        let manifest = StoreManifest {
            format_version: FORMAT_VERSION,
            segment_capacity: self.manager.capacity(),
            initial_capacity: self.initial_capacity as u64,
            next_segment_id,
            checkpoint,
            snapshot_entries: entries.len() as u32,
            snapshot_checksum,
        };
        manifest.store(&self.home_dir.join(MANIFEST_FILENAME))?;

        tracing::debug!(
            checkpoint_segment = checkpoint.segment_id,
            checkpoint_offset = checkpoint.offset,
            entries = entries.len(),
            "sync complete"
        );
        Ok(())
    }

    /// Count a write and checkpoint if the sync policy says so
    fn after_write(&self) -> Result<()> {
        if let SyncPolicy::EveryNWrites { count } = self.sync_policy {
            let writes = self.writes_since_sync.fetch_add(1, Ordering::AcqRel) + 1;
            if writes >= count {
                self.sync()?;
            }
        }
        Ok(())
    }

    /// Find the live entry and record for `key`
    ///
    /// Segments are resolved while the index shard is read-locked, so a
    /// compaction cannot retire them in between.
    fn locate(&self, key_hash: u64, key: &[u8]) -> Result<Option<(IndexEntry, Record)>> {
        let targets = self.index.lookup(key_hash, |entries| {
            entries
                .iter()
                .map(|entry| Ok((*entry, self.manager.segment_by_id(entry.segment_id)?)))
                .collect::<Result<Vec<_>>>()
        })?;

        for (entry, segment) in targets {
            let record = read_record(segment.as_ref(), &entry)?;
            if record.key() == key {
                return Ok(Some((entry, record)));
            }
        }
        Ok(None)
    }

    /// Whether the record behind `entry` belongs to `key`
    fn key_matches(&self, entry: &IndexEntry, key: &[u8]) -> Result<bool> {
        let segment = self.manager.segment_by_id(entry.segment_id)?;
        let record = read_record(segment.as_ref(), entry)?;
        Ok(record.key() == key)
    }
}

/// Read and verify the record an index entry points at
fn read_record(segment: &dyn Segment, entry: &IndexEntry) -> Result<Record> {
    let bytes = segment.read(entry.offset, entry.length)?;
    Record::decode(&bytes)
}
