//! Compaction
//!
//! Reclaims space held by orphaned records. A sealed segment whose live bytes
//! fall under the configured threshold has its live records (and any
//! tombstones still shadowing older segments) re-appended to the active
//! segment. After a checkpoint no longer references it, the segment file is
//! deleted.

use std::collections::HashSet;

use crate::error::Result;
use crate::index::{hash_key, IndexEntry};
use crate::record::RecordIter;

use super::StoreInner;

/// Summary of one compaction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Segments deleted
    pub segments_compacted: usize,

    /// Live records re-appended
    pub records_moved: u64,

    /// Tombstones re-appended because an older segment still holds the key
    pub tombstones_carried: u64,

    /// Tombstones dropped (key re-put, or nothing older left to shadow)
    pub tombstones_dropped: u64,

    /// Size of the deleted segments
    pub bytes_reclaimed: u64,
}

impl StoreInner {
    pub(super) fn compact(&self) -> Result<CompactionStats> {
        let _compaction = self.compaction_lock.lock();
        let mut stats = CompactionStats::default();

        let live = self.index.live_bytes_by_segment();
        let candidates = self
            .manager
            .compaction_candidates(&live, self.compaction_threshold);
        if candidates.is_empty() {
            return Ok(stats);
        }

        let candidate_ids: HashSet<u32> = candidates.iter().map(|s| s.id()).collect();
        let survivors: Vec<u32> = self
            .manager
            .list_segments()
            .iter()
            .map(|s| s.id())
            .filter(|id| !candidate_ids.contains(id))
            .collect();

        for segment in &candidates {
            let older_survivor = survivors.iter().any(|id| *id < segment.id());

            // Writers are held off while this segment's records move
            let _gate = self.write_gate.write();
            let end = segment.write_offset();
            if end == 0 {
                continue;
            }

            let bytes = segment.read(0, end)?;
            for item in RecordIter::new(&bytes, 0) {
                let (offset, record) = item?;
                let key_hash = hash_key(record.key());

                if record.is_tombstone() {
                    if older_survivor && self.locate(key_hash, record.key())?.is_none() {
                        self.manager.append(&record)?;
                        stats.tombstones_carried += 1;
                    } else {
                        stats.tombstones_dropped += 1;
                    }
                    continue;
                }

                let current = IndexEntry {
                    key_hash,
                    segment_id: segment.id(),
                    offset,
                    length: record.encoded_len() as u32,
                };
                if !self.index.contains_exact(&current) {
                    continue;
                }

                let location = self.manager.append(&record)?;
                if self
                    .index
                    .replace_exact(&current, IndexEntry::new(key_hash, location))
                {
                    stats.records_moved += 1;
                }
            }
        }

        // The snapshot must stop referencing the candidates before they go
        self.sync()?;

        for segment in &candidates {
            if self.manager.remove(segment.id())? {
                stats.segments_compacted += 1;
                stats.bytes_reclaimed += u64::from(segment.write_offset());
            }
        }

        tracing::info!(
            segments = stats.segments_compacted,
            records_moved = stats.records_moved,
            tombstones_carried = stats.tombstones_carried,
            bytes_reclaimed = stats.bytes_reclaimed,
            "compaction complete"
        );
        Ok(stats)
    }
}
