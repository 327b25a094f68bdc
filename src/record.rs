//! Record Module
//!
//! Serialized key/value records as they are laid out inside a segment.
//!
//! ## Record Format
//! ```text
//! ┌──────────────┬──────────────┬─────┬───────┬──────────────┐
//! │ KeyLen: u32  │ ValLen: u32  │ Key │ Value │ CRC32: u32   │
//! └──────────────┴──────────────┴─────┴───────┴──────────────┘
//! ```
//! - All integers are little-endian
//! - ValLen = u32::MAX marks a tombstone (no value bytes follow)
//! - CRC32 covers both length fields, the key and the value bytes

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, SegKvError};

/// Header size: KeyLen (4) + ValLen (4) = 8 bytes
pub const RECORD_HEADER_SIZE: usize = 8;

/// Trailer size: CRC32 (4)
pub const RECORD_CHECKSUM_SIZE: usize = 4;

/// Fixed per-record overhead
pub const RECORD_OVERHEAD: usize = RECORD_HEADER_SIZE + RECORD_CHECKSUM_SIZE;

/// Sentinel value length indicating a tombstone (deleted key)
pub(crate) const TOMBSTONE_MARKER: u32 = u32::MAX;

/// A single key/value record (or tombstone)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    key: Bytes,
    /// `None` for tombstones
    value: Option<Bytes>,
    checksum: u32,
}

impl Record {
    /// Create a put record
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<Self> {
        let key = key.into();
        let value = value.into();
        check_key_len(&key)?;
        if value.len() >= TOMBSTONE_MARKER as usize {
            return Err(SegKvError::InvalidRecord(format!(
                "value of {} bytes exceeds the maximum of {}",
                value.len(),
                TOMBSTONE_MARKER - 1
            )));
        }
        let checksum = compute_checksum(&key, Some(&value));
        Ok(Self {
            key,
            value: Some(value),
            checksum,
        })
    }

    /// Create a tombstone record for `key`
    pub fn tombstone(key: impl Into<Bytes>) -> Result<Self> {
        let key = key.into();
        check_key_len(&key)?;
        let checksum = compute_checksum(&key, None);
        Ok(Self {
            key,
            value: None,
            checksum,
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value, or `None` for a tombstone
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Number of bytes this record occupies once framed
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.key.len() + self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Append the framed record to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32_le(self.key.len() as u32);
        match &self.value {
            Some(value) => {
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(&self.key);
                buf.put_slice(value);
            }
            None => {
                buf.put_u32_le(TOMBSTONE_MARKER);
                buf.put_slice(&self.key);
            }
        }
        buf.put_u32_le(self.checksum);
    }

    /// Frame the record into a fresh buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode exactly one record occupying all of `bytes`
    ///
    /// Fails with `CorruptStore` on short input, trailing bytes, or a
    /// checksum mismatch.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let frame_len = frame_len(bytes).ok_or_else(|| {
            SegKvError::CorruptStore(format!("truncated record of {} bytes", bytes.len()))
        })?;
        if frame_len != bytes.len() {
            return Err(SegKvError::CorruptStore(format!(
                "record frame is {} bytes but {} were supplied",
                frame_len,
                bytes.len()
            )));
        }
        Self::decode_frame(bytes)
    }

    /// Decode a buffer already known to hold one complete frame
    fn decode_frame(bytes: &[u8]) -> Result<Self> {
        let key_len = read_u32(bytes, 0) as usize;
        let val_len = read_u32(bytes, 4);

        let key_start = RECORD_HEADER_SIZE;
        let key_end = key_start + key_len;
        let key = Bytes::copy_from_slice(&bytes[key_start..key_end]);

        let (value, value_end) = if val_len == TOMBSTONE_MARKER {
            (None, key_end)
        } else {
            let value_end = key_end + val_len as usize;
            (
                Some(Bytes::copy_from_slice(&bytes[key_end..value_end])),
                value_end,
            )
        };

        let stored = read_u32(bytes, value_end);
        let computed = compute_checksum(&key, value.as_deref());
        if stored != computed {
            return Err(SegKvError::CorruptStore(format!(
                "record checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }

        Ok(Self {
            key,
            value,
            checksum: stored,
        })
    }
}

/// Length of the frame starting at `bytes[0]`, if the header is present
///
/// Returns `None` when fewer than a full frame's bytes are available.
pub fn frame_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return None;
    }
    let key_len = read_u32(bytes, 0) as u64;
    let val_len = read_u32(bytes, 4);
    let body = if val_len == TOMBSTONE_MARKER {
        key_len
    } else {
        key_len + u64::from(val_len)
    };
    let total = RECORD_OVERHEAD as u64 + body;
    if total > bytes.len() as u64 {
        return None;
    }
    Some(total as usize)
}

/// Iterator over the records framed back to back in a byte range
///
/// Yields `(offset, record)` where offset is relative to `base_offset`.
/// Stops after the first error; `offset()` then reports where the bad
/// frame starts.
pub struct RecordIter<'a> {
    bytes: &'a [u8],
    base_offset: u32,
    pos: usize,
    failed: bool,
}

impl<'a> RecordIter<'a> {
    pub fn new(bytes: &'a [u8], base_offset: u32) -> Self {
        Self {
            bytes,
            base_offset,
            pos: 0,
            failed: false,
        }
    }

    /// Absolute offset of the next (or the failing) frame
    pub fn offset(&self) -> u32 {
        self.base_offset + self.pos as u32
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<(u32, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.bytes.len() {
            return None;
        }

        let rest = &self.bytes[self.pos..];
        let len = match frame_len(rest) {
            Some(len) => len,
            None => {
                self.failed = true;
                return Some(Err(SegKvError::CorruptStore(format!(
                    "truncated record at offset {}",
                    self.offset()
                ))));
            }
        };

        match Record::decode_frame(&rest[..len]) {
            Ok(record) => {
                let offset = self.offset();
                self.pos += len;
                Some(Ok((offset, record)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn check_key_len(key: &[u8]) -> Result<()> {
    if key.len() > u32::MAX as usize {
        return Err(SegKvError::InvalidRecord(format!(
            "key of {} bytes exceeds the maximum of {}",
            key.len(),
            u32::MAX
        )));
    }
    Ok(())
}

fn compute_checksum(key: &[u8], value: Option<&[u8]>) -> u32 {
    let val_len = value.map_or(TOMBSTONE_MARKER, |v| v.len() as u32);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&(key.len() as u32).to_le_bytes());
    hasher.update(&val_len.to_le_bytes());
    hasher.update(key);
    if let Some(v) = value {
        hasher.update(v);
    }
    hasher.finalize()
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}
