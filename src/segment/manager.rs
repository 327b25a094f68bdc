//! Segment Manager
//!
//! Owns every segment of a store and decides where the next record lands.
//!
//! ## Responsibilities
//! - Discover existing segment files on startup
//! - Keep one active segment for appends; seal it and roll over when full
//! - Dispatch reads by segment id
//! - Hand out segments in id order for recovery and compaction scans
//! - Delete reclaimed segments

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, SegKvError};
use crate::record::Record;

use super::{parse_segment_id, segment_path, Segment, SegmentFactory};

/// Where a record was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub segment_id: u32,
    pub offset: u32,
    pub length: u32,
}

struct SegmentSet {
    /// All tracked segments, keyed (and therefore ordered) by id
    segments: BTreeMap<u32, Arc<dyn Segment>>,
    /// Segment receiving appends, if one has been allocated
    active: Option<Arc<dyn Segment>>,
}

/// Manages the segment files of one store
///
/// ## Concurrency:
/// - `state`: RwLock (reads and appends share it, rollover/removal exclusive)
/// - Appends into the active segment are serialized by the segment itself
/// - `next_segment_id`: atomic, ids are never reused
pub struct SegmentManager {
    dir: PathBuf,
    capacity: u32,
    factory: Arc<dyn SegmentFactory>,
    state: RwLock<SegmentSet>,
    next_segment_id: AtomicU32,
}

impl SegmentManager {
    /// Open or create the segments in the given directory
    ///
    /// On startup:
    /// 1. Create directory if it doesn't exist
    /// 2. Discover existing segment files
    /// 3. Reopen each through the factory (ascending id)
    /// 4. Seal all but the newest; the newest stays active if it has room
    ///
    /// `min_next_id` lets a manifest keep ids from being reused after the
    /// newest segment file was removed.
    pub fn open(
        dir: &Path,
        capacity: u32,
        factory: Arc<dyn SegmentFactory>,
        min_next_id: u32,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut ids: Vec<u32> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_path = entry.path();
            if file_path.is_file() {
                if let Some(id) = parse_segment_id(&file_path) {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();

        let mut segments = BTreeMap::new();
        for id in &ids {
            let segment = factory.open(&segment_path(dir, *id), *id, capacity)?;
            segments.insert(*id, segment);
        }

        let newest = ids.last().copied();
        let mut active = None;
        for (id, segment) in &segments {
            if Some(*id) == newest && segment.remaining() > 0 {
                active = Some(Arc::clone(segment));
            } else {
                segment.seal();
            }
        }

        let next_id = newest.map(|id| id + 1).unwrap_or(1).max(min_next_id.max(1));

        tracing::debug!(
            dir = %dir.display(),
            segments = segments.len(),
            next_segment_id = next_id,
            factory = factory.name(),
            "opened segment manager"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            capacity,
            factory,
            state: RwLock::new(SegmentSet { segments, active }),
            next_segment_id: AtomicU32::new(next_id),
        })
    }

    /// Return the active segment, creating one if none is active
    pub fn allocate(&self) -> Result<Arc<dyn Segment>> {
        {
            let state = self.state.read();
            if let Some(active) = &state.active {
                if !active.is_sealed() {
                    return Ok(Arc::clone(active));
                }
            }
        }

        let mut state = self.state.write();
        // Re-check: another writer may have allocated while we waited
        if let Some(active) = &state.active {
            if !active.is_sealed() {
                return Ok(Arc::clone(active));
            }
        }
        self.create_active(&mut state)
    }

    /// Append a record to the active segment, rolling over when it is full
    pub fn append(&self, record: &Record) -> Result<RecordLocation> {
        let needed = record.encoded_len();
        if needed > self.capacity as usize {
            return Err(SegKvError::InvalidRecord(format!(
                "record of {} bytes exceeds the segment capacity of {}",
                needed, self.capacity
            )));
        }

        loop {
            let segment = self.allocate()?;
            match segment.append(record) {
                Ok(offset) => {
                    return Ok(RecordLocation {
                        segment_id: segment.id(),
                        offset,
                        length: needed as u32,
                    })
                }
                Err(SegKvError::SegmentFull { .. }) => self.roll_over(segment.id())?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Look up a segment for read dispatch
    pub fn segment_by_id(&self, id: u32) -> Result<Arc<dyn Segment>> {
        match self.state.read().segments.get(&id) {
            Some(segment) => Ok(Arc::clone(segment)),
            None => {
                tracing::error!(segment_id = id, "reference to untracked segment");
                Err(SegKvError::UnknownSegment(id))
            }
        }
    }

    /// All segments in ascending id order
    pub fn list_segments(&self) -> Vec<Arc<dyn Segment>> {
        self.state.read().segments.values().cloned().collect()
    }

    /// The segment currently receiving appends
    pub fn active_segment(&self) -> Option<Arc<dyn Segment>> {
        self.state.read().active.clone()
    }

    /// Position every future append lands at or after: `(segment_id, offset)`
    ///
    /// Only stable while appends are excluded by the caller.
    pub fn append_position(&self) -> (u32, u32) {
        let state = self.state.read();
        match &state.active {
            Some(active) if !active.is_sealed() => (active.id(), active.write_offset()),
            _ => (self.next_segment_id(), 0),
        }
    }

    /// Flush every segment with buffered appends
    pub fn flush_all(&self) -> Result<()> {
        for segment in self.list_segments() {
            segment.flush()?;
        }
        Ok(())
    }

    /// Sealed segments whose live bytes fall under `threshold` of their size
    ///
    /// `live_bytes` maps segment id to the bytes still referenced by the index.
    pub fn compaction_candidates(
        &self,
        live_bytes: &HashMap<u32, u64>,
        threshold: f64,
    ) -> Vec<Arc<dyn Segment>> {
        let state = self.state.read();
        let active_id = state.active.as_ref().map(|a| a.id());

        state
            .segments
            .values()
            .filter(|segment| Some(segment.id()) != active_id && segment.is_sealed())
            .filter(|segment| {
                let size = u64::from(segment.write_offset());
                let live = live_bytes.get(&segment.id()).copied().unwrap_or(0);
                size == 0 || (live as f64) < (size as f64) * threshold
            })
            .cloned()
            .collect()
    }

    /// Stop tracking a sealed segment and delete its file
    ///
    /// Returns `false` (and keeps the segment) if it is the active one.
    pub fn remove(&self, id: u32) -> Result<bool> {
        let segment = {
            let mut state = self.state.write();
            if state.active.as_ref().map(|a| a.id()) == Some(id) {
                return Ok(false);
            }
            state
                .segments
                .remove(&id)
                .ok_or(SegKvError::UnknownSegment(id))?
        };

        fs::remove_file(segment.path())?;
        tracing::debug!(segment_id = id, "removed segment");
        Ok(true)
    }

    /// Get the number of tracked segments
    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Get the next segment ID (for testing/debugging)
    pub fn next_segment_id(&self) -> u32 {
        self.next_segment_id.load(Ordering::SeqCst)
    }

    /// Get the segment directory path
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get the per-segment capacity
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Seal `full_id` and activate a fresh segment, unless someone already did
    fn roll_over(&self, full_id: u32) -> Result<()> {
        let mut state = self.state.write();
        let current = state.active.as_ref().map(|a| a.id());
        if current == Some(full_id) {
            if let Some(full) = &state.active {
                full.seal();
                tracing::debug!(
                    segment_id = full_id,
                    write_offset = full.write_offset(),
                    "sealed full segment"
                );
            }
            self.create_active(&mut state)?;
        }
        Ok(())
    }

    /// Create the next segment and make it active (state write lock held)
    fn create_active(&self, state: &mut SegmentSet) -> Result<Arc<dyn Segment>> {
        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let segment = self
            .factory
            .create(&segment_path(&self.dir, id), id, self.capacity)?;

        state.segments.insert(id, Arc::clone(&segment));
        state.active = Some(Arc::clone(&segment));

        tracing::debug!(segment_id = id, capacity = self.capacity, "created segment");
        Ok(segment)
    }
}
