//! Channel Segment
//!
//! Appends are written through a buffered file handle; reads go straight to
//! the file with a separate handle. A failed append seals the segment, so the
//! manager moves on to a fresh one.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;
use crate::record::Record;

use super::{check_file_len, check_fits, check_read_range, Segment, SegmentFactory};

/// Write buffer size for channel segments (64 KB)
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Factory for [`ChannelSegment`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelSegmentFactory;

impl SegmentFactory for ChannelSegmentFactory {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn create(&self, path: &Path, id: u32, capacity: u32) -> Result<Arc<dyn Segment>> {
        let writer = OpenOptions::new().create(true).append(true).open(path)?;
        writer.set_len(0)?;
        let reader = File::open(path)?;
        Ok(Arc::new(ChannelSegment::new(path, id, capacity, writer, reader, 0)))
    }

    fn open(&self, path: &Path, id: u32, capacity: u32) -> Result<Arc<dyn Segment>> {
        let writer = OpenOptions::new().append(true).open(path)?;
        let len = check_file_len(path, writer.metadata()?.len(), capacity)?;
        let reader = File::open(path)?;
        Ok(Arc::new(ChannelSegment::new(
            path, id, capacity, writer, reader, len,
        )))
    }
}

/// File-backed segment with a buffered append path
///
/// ## Concurrency:
/// - `writer`: Mutex, serializes appends and flushes
/// - `reader`: Mutex, positioned reads move the shared cursor
/// - `flushed_offset`: everything below it is in the file and readable
///   through `reader`
#[derive(Debug)]
pub struct ChannelSegment {
    id: u32,
    capacity: u32,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    reader: Mutex<File>,
    write_offset: AtomicU32,
    flushed_offset: AtomicU32,
    sealed: AtomicBool,
}

impl ChannelSegment {
    fn new(
        path: &Path,
        id: u32,
        capacity: u32,
        writer: File,
        reader: File,
        len: u32,
    ) -> Self {
        Self {
            id,
            capacity,
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::with_capacity(WRITE_BUFFER_SIZE, writer)),
            reader: Mutex::new(reader),
            write_offset: AtomicU32::new(len),
            flushed_offset: AtomicU32::new(len),
            sealed: AtomicBool::new(false),
        }
    }

    /// Push the write buffer to the file (no fsync)
    fn drain_writer(&self, writer: &mut BufWriter<File>) -> Result<()> {
        writer.flush()?;
        self.flushed_offset
            .store(self.write_offset(), Ordering::Release);
        Ok(())
    }

    /// Drop whatever a failed append left behind, keeping the file at `offset`
    ///
    /// The old buffer is taken apart without flushing it. Earlier records it
    /// still held are written out; bytes of the failed record are discarded.
    fn rewind(&self, writer: &mut BufWriter<File>, offset: u32) -> Result<()> {
        let handle = writer.get_ref().try_clone()?;
        let failed = std::mem::replace(
            writer,
            BufWriter::with_capacity(WRITE_BUFFER_SIZE, handle),
        );
        let (mut file, buffered) = failed.into_parts();
        let buffered = buffered.unwrap_or_default();

        let valid = u64::from(offset);
        let on_disk = file.metadata()?.len();
        if on_disk < valid {
            let missing = ((valid - on_disk) as usize).min(buffered.len());
            file.write_all(&buffered[..missing])?;
        } else if on_disk > valid {
            file.set_len(valid)?;
        }
        self.flushed_offset.store(offset, Ordering::Release);
        Ok(())
    }
}

impl Segment for ChannelSegment {
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
        let encoded = record.encode();
        let mut writer = self.writer.lock();
        let offset = self.write_offset();
        check_fits(
            self.id,
            self.capacity,
            offset,
            self.is_sealed(),
            encoded.len(),
        )?;

        if let Err(e) = writer.write_all(&encoded) {
            // Nothing more may land behind a record of unknown extent
            self.sealed.store(true, Ordering::Release);
            if let Err(rewind_error) = self.rewind(&mut writer, offset) {
                tracing::warn!(
                    segment_id = self.id,
                    offset,
                    error = %rewind_error,
                    "could not discard failed append"
                );
            }
            return Err(e.into());
        }
        let end = offset + encoded.len() as u32;
        self.write_offset.store(end, Ordering::Release);
        // BufWriter spills to the file on its own once the buffer fills
        self.flushed_offset
            .store(end - writer.buffer().len() as u32, Ordering::Release);
        Ok(offset)
    }

    fn read(&self, offset: u32, length: u32) -> Result<Bytes> {
        check_read_range(self.id, offset, length, self.write_offset())?;

        let end = offset + length;
        if end > self.flushed_offset.load(Ordering::Acquire) {
            let mut writer = self.writer.lock();
            self.drain_writer(&mut writer)?;
        }

        let mut buf = vec![0u8; length as usize];
        let mut reader = self.reader.lock();
        reader.seek(SeekFrom::Start(u64::from(offset)))?;
        reader.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn seal(&self) {
        let _writer = self.writer.lock();
        self.sealed.store(true, Ordering::Release);
    }

    fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.drain_writer(&mut writer)?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn truncate(&self, length: u32) -> Result<()> {
        let mut writer = self.writer.lock();
        if length >= self.write_offset() {
            return Ok(());
        }
        writer.flush()?;
        writer.get_ref().set_len(u64::from(length))?;
        writer.get_ref().sync_all()?;
        self.write_offset.store(length, Ordering::Release);
        self.flushed_offset.store(length, Ordering::Release);
        Ok(())
    }
}
