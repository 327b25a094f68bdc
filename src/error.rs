//! Error types for SegKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using SegKvError
pub type Result<T> = std::result::Result<T, SegKvError>;

/// Unified error type for SegKV operations
#[derive(Debug, Error)]
pub enum SegKvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Store is closed")]
    StoreClosed,

    // -------------------------------------------------------------------------
    // Segment Errors
    // -------------------------------------------------------------------------
    /// Raised by `Segment::append`; the segment manager absorbs it by rolling
    /// over to a fresh segment, so callers of `Store` never see it.
    #[error("Segment {segment_id} is full: need {needed} bytes, {remaining} remaining")]
    SegmentFull {
        segment_id: u32,
        needed: usize,
        remaining: u32,
    },

    #[error(
        "Read of {length} bytes at offset {offset} exceeds segment {segment_id} write offset {write_offset}"
    )]
    OutOfRange {
        segment_id: u32,
        offset: u32,
        length: u32,
        write_offset: u32,
    },

    /// The index references a segment the manager does not track.
    #[error("Unknown segment: {0}")]
    UnknownSegment(u32),

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Corrupt store: {0}")]
    CorruptStore(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}
