//! Store Manifest
//!
//! Small metadata file rewritten at every checkpoint. It pins the segment
//! capacity, keeps segment ids from being reused, and records where the
//! index snapshot was taken.
//!
//! ## File Format
//! ```text
//! ┌───────────┬───────────────┬───────────────────┬────────────┐
//! │ "SGKV"(4) │ PayloadLen(4) │ bincode payload   │ CRC32 (4)  │
//! └───────────┴───────────────┴───────────────────┴────────────┘
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SegKvError};

/// Magic bytes identifying a SegKV manifest
pub(crate) const MAGIC: &[u8; 4] = b"SGKV";

/// Current on-disk format version
pub const FORMAT_VERSION: u16 = 1;

/// Position the index snapshot reflects: every record appended before it is
/// covered, everything at or after it must be replayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub segment_id: u32,
    pub offset: u32,
}

impl Checkpoint {
    pub fn position(&self) -> (u32, u32) {
        (self.segment_id, self.offset)
    }
}

/// Persisted store metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub format_version: u16,
    pub segment_capacity: u32,
    pub initial_capacity: u64,
    pub next_segment_id: u32,
    pub checkpoint: Checkpoint,
    pub snapshot_entries: u32,
    /// CRC32 of the snapshot file written with this manifest
    pub snapshot_checksum: u32,
}

impl StoreManifest {
    /// Load the manifest at `path`; `Ok(None)` if the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if data.len() < 12 || &data[0..4] != MAGIC {
            return Err(SegKvError::CorruptStore(format!(
                "invalid manifest header in {}",
                path.display()
            )));
        }

        let payload_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if data.len() != 8 + payload_len + 4 {
            return Err(SegKvError::CorruptStore(format!(
                "manifest {} is {} bytes, expected {}",
                path.display(),
                data.len(),
                8 + payload_len + 4
            )));
        }

        let payload = &data[8..8 + payload_len];
        let crc_bytes = &data[8 + payload_len..];
        let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32fast::hash(payload) != stored_crc {
            return Err(SegKvError::CorruptStore(format!(
                "manifest checksum mismatch in {}",
                path.display()
            )));
        }

        let manifest: StoreManifest = bincode::deserialize(payload)
            .map_err(|e| SegKvError::Serialization(format!("manifest decode: {}", e)))?;

        if manifest.format_version != FORMAT_VERSION {
            return Err(SegKvError::CorruptStore(format!(
                "unsupported store format version: {}",
                manifest.format_version
            )));
        }

        Ok(Some(manifest))
    }

    /// Write the manifest atomically (temp file + rename)
    pub fn store(&self, path: &Path) -> Result<()> {
        let payload = bincode::serialize(self)
            .map_err(|e| SegKvError::Serialization(format!("manifest encode: {}", e)))?;

        let tmp_path = path.with_extension("meta.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writer.write_all(MAGIC)?;
            writer.write_all(&(payload.len() as u32).to_le_bytes())?;
            writer.write_all(&payload)?;
            writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        sync_parent_dir(path)
    }
}

/// Fsync the directory holding `path`, so a rename into it survives a crash
#[cfg(unix)]
pub(crate) fn sync_parent_dir(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Directories cannot be opened for fsync here; the rename is left to the OS
#[cfg(not(unix))]
pub(crate) fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}
