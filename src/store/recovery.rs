//! Store Recovery
//!
//! Rebuilds the index when a store is opened.
//!
//! 1. If the manifest's snapshot checksum matches the snapshot file, load the
//!    snapshot. Every entry must lie before the checkpoint and inside an
//!    existing segment, otherwise the store is corrupt.
//! 2. Replay records from the checkpoint onward (or from the first segment
//!    when no snapshot was usable), in segment id order.
//! 3. An unreadable record past the checkpoint, followed only by empty
//!    segments, is a torn write and is truncated away. Anywhere else it is
//!    corruption.

use std::collections::HashMap;

use crate::error::{Result, SegKvError};
use crate::index::{hash_key, read_snapshot, IndexEntry};
use crate::manifest::StoreManifest;
use crate::record::{Record, RecordIter};

use super::{StoreInner, SNAPSHOT_FILENAME};

/// Result of rebuilding the index on open
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Whether an index snapshot was loaded
    pub snapshot_loaded: bool,

    /// Entries taken from the snapshot
    pub snapshot_entries: u64,

    /// Segments (or segment tails) scanned
    pub segments_replayed: u64,

    /// Put records applied during replay
    pub records_replayed: u64,

    /// Tombstones applied during replay
    pub tombstones_replayed: u64,

    /// Bytes cut from a torn tail
    pub bytes_truncated: u64,
}

impl StoreInner {
    pub(super) fn recover(&self, manifest: Option<&StoreManifest>) -> Result<RecoveryResult> {
        let mut result = RecoveryResult::default();

        let (start, durable) = match manifest {
            Some(manifest) => (
                self.load_snapshot(manifest, &mut result)?,
                manifest.checkpoint.position(),
            ),
            None => ((0, 0), (0, 0)),
        };
        self.replay_from(start, durable, &mut result)?;

        Ok(result)
    }

    /// Load the snapshot if it belongs to `manifest`; returns where replay starts
    fn load_snapshot(
        &self,
        manifest: &StoreManifest,
        result: &mut RecoveryResult,
    ) -> Result<(u32, u32)> {
        let path = self.home_dir.join(SNAPSHOT_FILENAME);
        if !path.exists() {
            tracing::warn!("manifest present without index snapshot, replaying all segments");
            return Ok((0, 0));
        }

        let snapshot = read_snapshot(&path)?;
        if snapshot.checksum != manifest.snapshot_checksum
            || snapshot.entries.len() != manifest.snapshot_entries as usize
        {
            // Crash between the snapshot rename and the manifest rename
            tracing::warn!(
                expected = manifest.snapshot_checksum,
                actual = snapshot.checksum,
                "index snapshot does not match manifest, replaying all segments"
            );
            return Ok((0, 0));
        }

        let checkpoint = manifest.checkpoint.position();
        let segment_ends: HashMap<u32, u32> = self
            .manager
            .list_segments()
            .iter()
            .map(|segment| (segment.id(), segment.write_offset()))
            .collect();

        for entry in &snapshot.entries {
            validate_snapshot_entry(entry, checkpoint, &segment_ends)?;
            self.index.insert_distinct(*entry);
        }

        result.snapshot_loaded = true;
        result.snapshot_entries = snapshot.entries.len() as u64;
        Ok(checkpoint)
    }

    /// Replay every record at or after `start`
    ///
    /// `durable` is the last checkpoint; bytes before it were synced and are
    /// never treated as a torn write.
    fn replay_from(
        &self,
        start: (u32, u32),
        durable: (u32, u32),
        result: &mut RecoveryResult,
    ) -> Result<()> {
        let segments = self.manager.list_segments();

        for (i, segment) in segments.iter().enumerate() {
            if segment.id() < start.0 {
                continue;
            }
            let from = if segment.id() == start.0 { start.1 } else { 0 };
            let end = segment.write_offset();
            if from > end {
                return Err(SegKvError::CorruptStore(format!(
                    "checkpoint offset {} lies past the end ({}) of segment {}",
                    from,
                    end,
                    segment.id()
                )));
            }
            if from == end {
                continue;
            }

            let bytes = segment.read(from, end - from)?;
            let mut records = RecordIter::new(&bytes, from);
            let mut failure = None;
            for item in records.by_ref() {
                match item {
                    Ok((offset, record)) => self.replay_record(segment.id(), offset, &record, result)?,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            result.segments_replayed += 1;

            let Some(error) = failure else {
                continue;
            };
            let bad_offset = records.offset();
            // Later segments stay empty when a crash lost their unflushed tails
            let later_empty = segments[i + 1..]
                .iter()
                .all(|later| later.write_offset() == 0);
            if (segment.id(), bad_offset) < durable || !later_empty {
                return Err(SegKvError::CorruptStore(format!(
                    "segment {} at offset {}: {}",
                    segment.id(),
                    bad_offset,
                    error
                )));
            }

            tracing::warn!(
                segment_id = segment.id(),
                offset = bad_offset,
                bytes = end - bad_offset,
                error = %error,
                "truncating torn segment tail"
            );
            segment.truncate(bad_offset)?;
            result.bytes_truncated += u64::from(end - bad_offset);
        }

        Ok(())
    }

    fn replay_record(
        &self,
        segment_id: u32,
        offset: u32,
        record: &Record,
        result: &mut RecoveryResult,
    ) -> Result<()> {
        let key_hash = hash_key(record.key());

        if record.is_tombstone() {
            self.index
                .remove_matching(key_hash, (segment_id, offset), |existing| {
                    self.key_matches(existing, record.key())
                })?;
            result.tombstones_replayed += 1;
        } else {
            let entry = IndexEntry {
                key_hash,
                segment_id,
                offset,
                length: record.encoded_len() as u32,
            };
            self.index
                .upsert(entry, |existing| self.key_matches(existing, record.key()))?;
            result.records_replayed += 1;
        }
        Ok(())
    }
}

fn validate_snapshot_entry(
    entry: &IndexEntry,
    checkpoint: (u32, u32),
    segment_ends: &HashMap<u32, u32>,
) -> Result<()> {
    if entry.position() >= checkpoint {
        return Err(SegKvError::CorruptStore(format!(
            "snapshot entry at segment {} offset {} lies past checkpoint {:?}",
            entry.segment_id, entry.offset, checkpoint
        )));
    }

    let Some(&end) = segment_ends.get(&entry.segment_id) else {
        return Err(SegKvError::CorruptStore(format!(
            "snapshot references missing segment {}",
            entry.segment_id
        )));
    };

    if u64::from(entry.offset) + u64::from(entry.length) > u64::from(end) {
        return Err(SegKvError::CorruptStore(format!(
            "snapshot entry at segment {} offset {} length {} exceeds segment end {}",
            entry.segment_id, entry.offset, entry.length, end
        )));
    }
    Ok(())
}
