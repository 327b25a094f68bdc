//! Index Snapshot
//!
//! Persists the index at a checkpoint so startup does not have to replay
//! every segment.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ EntryCount: u32                                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ KeyHash: u64 │ SegmentId: u32 │ Offset: u32 │ Length: u32     │
//! │ ... repeated EntryCount times (20 bytes each) ...            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//! Integers are little-endian. The CRC32 of the whole file is kept in the
//! manifest rather than in the file itself.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, SegKvError};
use crate::manifest::sync_parent_dir;

use super::IndexEntry;

/// Size of one serialized entry
pub const SNAPSHOT_ENTRY_SIZE: usize = 20;

/// Size of the entry-count prefix
const COUNT_SIZE: usize = 4;

/// A decoded snapshot file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub entries: Vec<IndexEntry>,
    /// CRC32 of the file contents
    pub checksum: u32,
}

/// Write `entries` to `path` atomically (temp file + rename)
///
/// Returns the CRC32 of the written bytes.
pub fn write_snapshot(path: &Path, entries: &[IndexEntry]) -> Result<u32> {
    let count = u32::try_from(entries.len()).map_err(|_| {
        SegKvError::Serialization(format!(
            "{} index entries exceed the snapshot limit of {}",
            entries.len(),
            u32::MAX
        ))
    })?;

    let mut buf = BytesMut::with_capacity(COUNT_SIZE + entries.len() * SNAPSHOT_ENTRY_SIZE);
    buf.put_u32_le(count);
    for entry in entries {
        buf.put_u64_le(entry.key_hash);
        buf.put_u32_le(entry.segment_id);
        buf.put_u32_le(entry.offset);
        buf.put_u32_le(entry.length);
    }
    let checksum = crc32fast::hash(&buf);

    let tmp_path = path.with_extension("snapshot.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(&buf)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)?;

    tracing::debug!(path = %path.display(), entries = count, "wrote index snapshot");
    Ok(checksum)
}

/// Read and decode the snapshot at `path`
///
/// Fails with `CorruptStore` if the length does not match the entry count.
pub fn read_snapshot(path: &Path) -> Result<IndexSnapshot> {
    let data = fs::read(path)?;
    if data.len() < COUNT_SIZE {
        return Err(SegKvError::CorruptStore(format!(
            "index snapshot {} is only {} bytes",
            path.display(),
            data.len()
        )));
    }

    let checksum = crc32fast::hash(&data);
    let mut cursor = &data[..];
    let count = cursor.get_u32_le() as usize;

    let expected = COUNT_SIZE as u64 + count as u64 * SNAPSHOT_ENTRY_SIZE as u64;
    if data.len() as u64 != expected {
        return Err(SegKvError::CorruptStore(format!(
            "index snapshot {} holds {} bytes, expected {} for {} entries",
            path.display(),
            data.len(),
            expected,
            count
        )));
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(IndexEntry {
            key_hash: cursor.get_u64_le(),
            segment_id: cursor.get_u32_le(),
            offset: cursor.get_u32_le(),
            length: cursor.get_u32_le(),
        });
    }

    Ok(IndexSnapshot { entries, checksum })
}
