//! Index Module
//!
//! In-memory map from key hash to record location.
//!
//! ## Responsibilities
//! - O(1) lookup of where a key's latest record lives
//! - Disambiguate hash collisions (buckets hold one entry per distinct key)
//! - Keep only the newest record per key, by append position
//! - Produce snapshots for checkpoints and per-segment liveness for compaction
//!
//! ## Data Structure Choice
//! Sharded `HashMap<u64, Bucket>`, each shard behind its own RwLock:
//! - Gets on different shards never contend; gets on one shard share a read lock
//! - Writers exclude each other per shard, which covers same-key serialization
//! - Pre-sized from the configured key-count hint; growing past it rehashes
//!
//! The index never stores key bytes. Callers that need to tell colliding keys
//! apart pass a `same_key` check that reads the stored record.

mod snapshot;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;
use crate::segment::RecordLocation;

pub use snapshot::{read_snapshot, write_snapshot, IndexSnapshot, SNAPSHOT_ENTRY_SIZE};

/// Stable 64-bit hash of a key (XXH3)
pub fn hash_key(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// Location of the live record for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexEntry {
    pub key_hash: u64,
    pub segment_id: u32,
    pub offset: u32,
    pub length: u32,
}

impl IndexEntry {
    pub fn new(key_hash: u64, location: RecordLocation) -> Self {
        Self {
            key_hash,
            segment_id: location.segment_id,
            offset: location.offset,
            length: location.length,
        }
    }

    /// Append position: `(segment_id, offset)`
    pub fn position(&self) -> (u32, u32) {
        (self.segment_id, self.offset)
    }

    /// Whether this record was appended after `other`
    pub fn is_after(&self, other: &IndexEntry) -> bool {
        self.position() > other.position()
    }
}

/// Outcome of [`Index::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The key had no entry
    Inserted,
    /// The key's previous entry, now an orphaned record
    Replaced(IndexEntry),
    /// The key already points at a newer record; the new one is the orphan
    Superseded,
}

/// Distinct keys sharing one hash (almost always a single entry)
type Bucket = Vec<IndexEntry>;

type Shard = RwLock<HashMap<u64, Bucket>>;

/// Sharded key-hash index
pub struct Index {
    shards: Box<[CachePadded<Shard>]>,
    mask: usize,
    len: AtomicUsize,
}

impl Index {
    /// Default number of lock shards
    pub const DEFAULT_SHARDS: usize = 64;

    /// Create an empty index with the default shard count
    pub fn new() -> Self {
        Self::with_capacity(0, Self::DEFAULT_SHARDS)
    }

    /// Create an index pre-sized for `capacity` keys
    ///
    /// `shard_count` is rounded up to a power of two.
    pub fn with_capacity(capacity: usize, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let per_shard = capacity.div_ceil(shard_count);
        let shards = (0..shard_count)
            .map(|_| CachePadded::new(RwLock::new(HashMap::with_capacity(per_shard))))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            mask: shard_count - 1,
            len: AtomicUsize::new(0),
        }
    }

    // =========================================================================
    // Hash-level operations
    //
    // These treat the hash as the key and never consult the segments, so
    // colliding keys are not told apart: they act on the first entry in the
    // bucket. Store reads and writes go through the key-aware operations.
    // =========================================================================

    /// Insert or replace the first entry under `entry.key_hash`. Returns the
    /// entry it replaced, which may belong to a colliding key.
    pub fn put(&self, entry: IndexEntry) -> Option<IndexEntry> {
        let mut shard = self.shard(entry.key_hash).write();
        let bucket = shard.entry(entry.key_hash).or_default();
        if let Some(slot) = bucket.first_mut() {
            return Some(std::mem::replace(slot, entry));
        }
        bucket.push(entry);
        self.len.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// First entry stored under `key_hash`, whichever key it belongs to
    pub fn get(&self, key_hash: u64) -> Option<IndexEntry> {
        self.shard(key_hash)
            .read()
            .get(&key_hash)
            .and_then(|bucket| bucket.first().copied())
    }

    /// Remove every entry stored under `key_hash`, colliding keys included,
    /// returning the first
    pub fn remove(&self, key_hash: u64) -> Option<IndexEntry> {
        let bucket = self.shard(key_hash).write().remove(&key_hash)?;
        self.len.fetch_sub(bucket.len(), Ordering::Relaxed);
        bucket.first().copied()
    }

    // =========================================================================
    // Key-aware operations
    // =========================================================================

    /// All entries stored under `key_hash` (one per distinct key)
    pub fn candidates(&self, key_hash: u64) -> Vec<IndexEntry> {
        self.lookup(key_hash, |entries| entries.to_vec())
    }

    /// Run `f` over the entries for `key_hash` while holding the shard read lock
    pub fn lookup<T>(&self, key_hash: u64, f: impl FnOnce(&[IndexEntry]) -> T) -> T {
        let shard = self.shard(key_hash).read();
        match shard.get(&key_hash) {
            Some(bucket) => f(bucket),
            None => f(&[]),
        }
    }

    /// Insert `entry` as a distinct key, without looking for a match
    ///
    /// Used when loading a snapshot, which holds one entry per key.
    pub fn insert_distinct(&self, entry: IndexEntry) {
        self.shard(entry.key_hash)
            .write()
            .entry(entry.key_hash)
            .or_default()
            .push(entry);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Insert or replace the entry of the key `same_key` recognizes
    ///
    /// The existing entry is only replaced by one appended after it. The shard
    /// write lock is held while `same_key` runs, so concurrent upserts of the
    /// same key serialize here.
    pub fn upsert<F>(&self, entry: IndexEntry, mut same_key: F) -> Result<Upsert>
    where
        F: FnMut(&IndexEntry) -> Result<bool>,
    {
        let mut shard = self.shard(entry.key_hash).write();

        if let Some(bucket) = shard.get_mut(&entry.key_hash) {
            for slot in bucket.iter_mut() {
                if same_key(slot)? {
                    if entry.is_after(slot) {
                        return Ok(Upsert::Replaced(std::mem::replace(slot, entry)));
                    }
                    return Ok(Upsert::Superseded);
                }
            }
        }

        shard.entry(entry.key_hash).or_default().push(entry);
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(Upsert::Inserted)
    }

    /// Remove the entry of the key `same_key` recognizes, if it was appended
    /// before `before` (the tombstone's position)
    pub fn remove_matching<F>(
        &self,
        key_hash: u64,
        before: (u32, u32),
        mut same_key: F,
    ) -> Result<Option<IndexEntry>>
    where
        F: FnMut(&IndexEntry) -> Result<bool>,
    {
        let mut shard = self.shard(key_hash).write();
        let Some(bucket) = shard.get_mut(&key_hash) else {
            return Ok(None);
        };

        let mut found = None;
        for (i, slot) in bucket.iter().enumerate() {
            if same_key(slot)? {
                found = Some(i);
                break;
            }
        }

        let Some(i) = found else {
            return Ok(None);
        };
        if bucket[i].position() >= before {
            return Ok(None);
        }

        let removed = bucket.swap_remove(i);
        if bucket.is_empty() {
            shard.remove(&key_hash);
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
        Ok(Some(removed))
    }

    /// Whether `entry` is exactly the live entry of its key
    pub fn contains_exact(&self, entry: &IndexEntry) -> bool {
        self.lookup(entry.key_hash, |entries| entries.contains(entry))
    }

    /// Swap `old` for `new` if `old` is still live
    pub fn replace_exact(&self, old: &IndexEntry, new: IndexEntry) -> bool {
        let mut shard = self.shard(old.key_hash).write();
        let Some(bucket) = shard.get_mut(&old.key_hash) else {
            return false;
        };
        match bucket.iter_mut().find(|slot| **slot == *old) {
            Some(slot) => {
                *slot = new;
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Whole-index views
    // =========================================================================

    /// Copy of every entry (shard by shard)
    pub fn entries(&self) -> Vec<IndexEntry> {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let shard = shard.read();
            for bucket in shard.values() {
                out.extend_from_slice(bucket);
            }
        }
        out
    }

    /// Bytes referenced by live entries, per segment id
    pub fn live_bytes_by_segment(&self) -> HashMap<u32, u64> {
        let mut live: HashMap<u32, u64> = HashMap::new();
        for shard in self.shards.iter() {
            let shard = shard.read();
            for entry in shard.values().flatten() {
                *live.entry(entry.segment_id).or_default() += u64::from(entry.length);
            }
        }
        live
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            let removed: usize = shard.values().map(Vec::len).sum();
            shard.clear();
            self.len.fetch_sub(removed, Ordering::Relaxed);
        }
    }

    fn shard(&self, key_hash: u64) -> &Shard {
        // Low bits pick the shard; the std hasher re-mixes within it
        &self.shards[key_hash as usize & self.mask]
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}
