//! Memory Segment
//!
//! Holds the full segment contents in memory; the file only receives the
//! unflushed tail when `flush` is called.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::record::Record;

use super::{check_file_len, check_fits, check_read_range, Segment, SegmentFactory};

/// Factory for [`MemorySegment`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySegmentFactory;

impl SegmentFactory for MemorySegmentFactory {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn create(&self, path: &Path, id: u32, capacity: u32) -> Result<Arc<dyn Segment>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Arc::new(MemorySegment::new(
            path,
            id,
            capacity,
            file,
            BytesMut::new(),
        )))
    }

    fn open(&self, path: &Path, id: u32, capacity: u32) -> Result<Arc<dyn Segment>> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = check_file_len(path, file.metadata()?.len(), capacity)?;

        let mut contents = vec![0u8; len as usize];
        file.read_exact(&mut contents)?;

        Ok(Arc::new(MemorySegment::new(
            path,
            id,
            capacity,
            file,
            BytesMut::from(&contents[..]),
        )))
    }
}

/// Segment whose contents live in memory until flushed
///
/// ## Concurrency:
/// - `data`: RwLock (appends exclusive, reads shared)
/// - `file`: Mutex, only touched by flush/truncate
/// - `write_offset`: atomic mirror of `data.len()` for lock-free bounds checks
#[derive(Debug)]
pub struct MemorySegment {
    id: u32,
    capacity: u32,
    path: PathBuf,
    data: RwLock<BytesMut>,
    write_offset: AtomicU32,
    /// Backing file and how much of `data` it already holds
    file: Mutex<(File, u32)>,
    sealed: AtomicBool,
}

impl MemorySegment {
    fn new(path: &Path, id: u32, capacity: u32, file: File, data: BytesMut) -> Self {
        let len = data.len() as u32;
        Self {
            id,
            capacity,
            path: path.to_path_buf(),
            data: RwLock::new(data),
            write_offset: AtomicU32::new(len),
            file: Mutex::new((file, len)),
            sealed: AtomicBool::new(false),
        }
    }
}

impl Segment for MemorySegment {
    fn id(&self) -> u32 {
        self.id
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn write_offset(&self) -> u32 {
        self.write_offset.load(Ordering::Acquire)
    }

    fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &Record) -> Result<u32> {
        let needed = record.encoded_len();
        let mut data = self.data.write();
        let offset = data.len() as u32;
        check_fits(self.id, self.capacity, offset, self.is_sealed(), needed)?;

        record.encode_into(&mut data);
        self.write_offset
            .store(offset + needed as u32, Ordering::Release);
        Ok(offset)
    }

    fn read(&self, offset: u32, length: u32) -> Result<Bytes> {
        check_read_range(self.id, offset, length, self.write_offset())?;
        let data = self.data.read();
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&data[start..start + length as usize]))
    }

    fn seal(&self) {
        // Taken so no append is mid-flight when the flag flips
        let _data = self.data.write();
        self.sealed.store(true, Ordering::Release);
    }

    fn flush(&self) -> Result<()> {
        let mut guard = self.file.lock();
        let (file, flushed) = &mut *guard;

        let end = self.write_offset();
        if end == *flushed {
            return Ok(());
        }

        let tail = {
            let data = self.data.read();
            Bytes::copy_from_slice(&data[*flushed as usize..end as usize])
        };

        file.seek(SeekFrom::Start(u64::from(*flushed)))?;
        file.write_all(&tail)?;
        file.sync_data()?;
        *flushed = end;

        tracing::trace!(segment_id = self.id, bytes = tail.len(), "flushed memory segment");
        Ok(())
    }

    fn truncate(&self, length: u32) -> Result<()> {
        // Same lock order as flush: file, then data
        let mut guard = self.file.lock();
        let (file, flushed) = &mut *guard;

        let mut data = self.data.write();
        if length as usize >= data.len() {
            return Ok(());
        }
        data.truncate(length as usize);
        self.write_offset.store(length, Ordering::Release);

        file.set_len(u64::from(length))?;
        file.sync_all()?;
        *flushed = (*flushed).min(length);
        Ok(())
    }
}
