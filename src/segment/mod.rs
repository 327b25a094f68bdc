//! Segment Module
//!
//! Fixed-capacity, append-only storage units holding framed records.
//!
//! ## Responsibilities
//! - Append records at the current write offset
//! - Serve byte-range reads for index lookups
//! - Seal once full (read-only from then on)
//! - Flush buffered appends to the segment file on demand
//!
//! ## Backing Strategies
//! Segments are created through a [`SegmentFactory`] chosen at configuration
//! time:
//! - [`MemorySegmentFactory`]: whole segment held in memory, unflushed tail
//!   written to the file on flush
//! - [`ChannelSegmentFactory`]: appends go through a buffered file handle,
//!   reads are positioned file reads
//!
//! Both produce byte-identical segment files, so a store may be reopened with
//! either factory.

mod channel;
mod manager;
mod memory;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, SegKvError};
use crate::record::Record;

pub use channel::{ChannelSegment, ChannelSegmentFactory};
pub use manager::{RecordLocation, SegmentManager};
pub use memory::{MemorySegment, MemorySegmentFactory};

/// A fixed-capacity append-only storage unit
///
/// Invariant: `write_offset() <= capacity()`. A sealed segment rejects
/// appends but stays readable.
pub trait Segment: Send + Sync + fmt::Debug {
    /// Segment id (also encoded in the file name)
    fn id(&self) -> u32;

    /// Byte capacity
    fn capacity(&self) -> u32;

    /// End of the last appended record
    fn write_offset(&self) -> u32;

    /// Whether appends are still accepted
    fn is_sealed(&self) -> bool;

    /// Path of the backing file
    fn path(&self) -> &Path;

    /// Append a record, returning the offset it starts at
    ///
    /// Fails with `SegmentFull` if the segment is sealed or the record does
    /// not fit in the remaining capacity. Durable only after `flush`.
    fn append(&self, record: &Record) -> Result<u32>;

    /// Read `length` raw bytes starting at `offset`
    ///
    /// Fails with `OutOfRange` if the range extends past the write offset.
    fn read(&self, offset: u32, length: u32) -> Result<Bytes>;

    /// Mark the segment immutable for appends
    fn seal(&self);

    /// Force buffered appends to durable storage
    fn flush(&self) -> Result<()>;

    /// Drop everything past `length` (recovery of a torn tail)
    fn truncate(&self, length: u32) -> Result<()>;

    /// Bytes still available for appends
    fn remaining(&self) -> u32 {
        self.capacity().saturating_sub(self.write_offset())
    }
}

/// Creates and reopens segments of one backing strategy
pub trait SegmentFactory: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Create an empty segment file at `path`
    fn create(&self, path: &Path, id: u32, capacity: u32) -> Result<Arc<dyn Segment>>;

    /// Reopen an existing segment file; its length becomes the write offset
    fn open(&self, path: &Path, id: u32, capacity: u32) -> Result<Arc<dyn Segment>>;
}

// =============================================================================
// Shared Helpers (used by both segment kinds and the manager)
// =============================================================================

/// Generate the file path for a segment with given ID
pub fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("segment_{:06}.seg", id))
}

/// Parse segment ID from filename
/// "segment_000042.seg" → Some(42)
pub fn parse_segment_id(path: &Path) -> Option<u32> {
    if path.extension()? != "seg" {
        return None;
    }
    let name = path.file_stem()?.to_string_lossy();
    let id_str = name.strip_prefix("segment_")?;
    id_str.parse().ok()
}

/// Validate a read range against the current write offset
pub(crate) fn check_read_range(
    segment_id: u32,
    offset: u32,
    length: u32,
    write_offset: u32,
) -> Result<()> {
    let end = u64::from(offset) + u64::from(length);
    if end > u64::from(write_offset) {
        return Err(SegKvError::OutOfRange {
            segment_id,
            offset,
            length,
            write_offset,
        });
    }
    Ok(())
}

/// Validate that a record fits in the space left after `write_offset`
pub(crate) fn check_fits(
    segment_id: u32,
    capacity: u32,
    write_offset: u32,
    sealed: bool,
    needed: usize,
) -> Result<()> {
    let remaining = capacity.saturating_sub(write_offset);
    if sealed || needed > remaining as usize {
        return Err(SegKvError::SegmentFull {
            segment_id,
            needed,
            remaining: if sealed { 0 } else { remaining },
        });
    }
    Ok(())
}

/// Reject segment files that outgrew the configured capacity
pub(crate) fn check_file_len(path: &Path, len: u64, capacity: u32) -> Result<u32> {
    if len > u64::from(capacity) {
        return Err(SegKvError::CorruptStore(format!(
            "segment file {} is {} bytes, larger than the capacity of {}",
            path.display(),
            len,
            capacity
        )));
    }
    Ok(len as u32)
}
