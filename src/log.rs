//! Durable, crash-recoverable append-only probe log over a memory-mapped
//! window.
//!
//! One `ProbeLog` covers one roll cycle file. Records are appended at an
//! atomic cursor; when a record would overrun the window the log resizes:
//! flush the current window, remap a fresh window immediately following the
//! end of data, reset the cursor. Resize is guarded by a try-lock; a writer
//! that loses the race drops its probes rather than block.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ProbeError, ProbeResult};
use crate::format::{decode_compressed_header, encode_compressed_header, WireFormat};
use crate::region::MappedRegion;

/// Result of an append attempt. Dropped is not an error: bounded data loss
/// is the accepted price of the lock-free hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Dropped,
}

pub struct ProbeLog {
    region: MappedRegion,
    cursor: AtomicU32,
    resize_lock: Mutex<()>,
    format: WireFormat,
    cycle_start_millis: i64,
}

impl ProbeLog {
    /// Opens (creating if absent) the log at `path`, mapping `mmap_size`
    /// bytes. A non-empty file is validated and its cursor recovered by
    /// scanning for the end of valid data; the window is then mapped
    /// starting at that boundary.
    pub fn open(
        path: &Path,
        mmap_size: u32,
        format: WireFormat,
        cycle_start_millis: i64,
    ) -> ProbeResult<Self> {
        let existing_len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };

        if existing_len == 0 {
            let region = MappedRegion::map(path, 0, mmap_size)?;
            let mut cursor = 0u32;
            if format == WireFormat::Compressed {
                region.write_bytes(0, &encode_compressed_header(cycle_start_millis))?;
                cursor = format.header_size() as u32;
            }
            return Ok(Self {
                region,
                cursor: AtomicU32::new(cursor),
                resize_lock: Mutex::new(()),
                format,
                cycle_start_millis,
            });
        }

        let end = recover_end(path, format, cycle_start_millis)?;
        debug!(path = %path.display(), end, "recovered probe log cursor");
        let region = MappedRegion::map(path, end, mmap_size)?;
        Ok(Self {
            region,
            cursor: AtomicU32::new(0),
            resize_lock: Mutex::new(()),
            format,
            cycle_start_millis,
        })
    }

    #[inline]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    #[inline]
    pub fn cycle_start_millis(&self) -> i64 {
        self.cycle_start_millis
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Absolute end of written data within the backing file.
    pub fn end_of_data(&self) -> u64 {
        self.region.file_offset() + self.cursor.load(Ordering::Acquire) as u64
    }

    /// Appends one encoded probe record.
    pub fn write_probe(&self, count: i32, timestamp_millis: i64) -> ProbeResult<WriteOutcome> {
        let mut buf = [0u8; 12];
        let record = &mut buf[..self.format.record_size()];
        self.format
            .encode(count, timestamp_millis, self.cycle_start_millis, record);
        let record = &buf[..self.format.record_size()];
        self.append(record)
    }

    /// Appends a batch of whole encoded records at the current cursor.
    ///
    /// If the batch would overrun the window the log resizes under the
    /// resize lock; losing the lock race drops the batch.
    pub fn append(&self, bytes: &[u8]) -> ProbeResult<WriteOutcome> {
        debug_assert_eq!(bytes.len() % self.format.record_size(), 0);
        if bytes.is_empty() {
            return Ok(WriteOutcome::Written);
        }
        let len = bytes.len() as u32;
        if len > self.region.capacity() {
            return Err(ProbeError::invalid_state(format!(
                "batch of {} bytes can never fit a {} byte window",
                len,
                self.region.capacity()
            )));
        }

        if let Some(offset) = self.reserve(len) {
            self.region.write_bytes(offset as usize, bytes)?;
            return Ok(WriteOutcome::Written);
        }

        // Window exhausted: resize, unless another thread is mid-resize.
        let _guard = match self.resize_lock.try_lock() {
            Some(guard) => guard,
            None => {
                warn!(path = %self.path().display(), "dropping probes: concurrent resize in progress");
                return Ok(WriteOutcome::Dropped);
            }
        };

        // Another thread may have resized while we waited on nothing; retry
        // before paying for a remap.
        if let Some(offset) = self.reserve(len) {
            self.region.write_bytes(offset as usize, bytes)?;
            return Ok(WriteOutcome::Written);
        }

        self.region.flush()?;
        let consumed = self.cursor.load(Ordering::Acquire);
        let new_offset = self.region.file_offset() + consumed as u64;
        self.region.remap(new_offset)?;
        self.cursor.store(0, Ordering::Release);
        debug!(path = %self.path().display(), file_offset = new_offset, "resized probe log window");

        match self.reserve(len) {
            Some(offset) => {
                self.region.write_bytes(offset as usize, bytes)?;
                Ok(WriteOutcome::Written)
            }
            // Unreachable given len <= capacity, but never invent an offset.
            None => Ok(WriteOutcome::Dropped),
        }
    }

    fn reserve(&self, len: u32) -> Option<u32> {
        let capacity = self.region.capacity();
        self.cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(len)?;
                if next <= capacity { Some(next) } else { None }
            })
            .ok()
    }

    /// Makes buffered writes visible to co-located readers.
    pub fn flush(&self) -> ProbeResult<()> {
        self.region.flush()
    }

    /// Flushes and trims the zero tail so the file ends at the last record.
    pub fn close(self) -> ProbeResult<()> {
        self.region.flush_and_sync()?;
        let end = self.end_of_data();
        let file = OpenOptions::new().write(true).open(self.path())?;
        // Region must unmap before truncation on platforms that object to
        // shrinking a mapped file.
        drop(self.region);
        file.set_len(end)?;
        Ok(())
    }
}

impl fmt::Debug for ProbeLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeLog")
            .field("path", &self.path())
            .field("format", &self.format)
            .field("cycle_start_millis", &self.cycle_start_millis)
            .field("end_of_data", &self.end_of_data())
            .finish()
    }
}

/// Locates the end of valid data in `data` without a written index.
///
/// Binary-searches the record-aligned slots for the first all-zero slot
/// (live records are never all-zero), then validates the trailing record and
/// scans backward one record width at a time until a valid boundary is
/// found, or the data start if none exists. Returns a byte offset relative
/// to the start of `data`.
pub(crate) fn scan_data_end(data: &[u8], format: WireFormat) -> usize {
    let header = format.header_size();
    let record = format.record_size();
    if data.len() < header {
        return data.len();
    }
    let slots = (data.len() - header) / record;

    let slot_at = |index: usize| &data[header + index * record..header + (index + 1) * record];

    // Zeros form a suffix of the slot grid in a well-formed log.
    let mut lo = 0usize;
    let mut hi = slots;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if slot_at(mid).iter().all(|b| *b == 0) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }

    let mut boundary = lo;
    while boundary > 0 {
        if format.trailing_record_valid(slot_at(boundary - 1)) {
            break;
        }
        boundary -= 1;
    }
    header + boundary * record
}

/// Reopens a non-empty file, validates its header against the requested
/// cycle, recovers the true end of data, and zeroes everything past the
/// boundary so stale partial bytes cannot masquerade as records later.
/// Recovery only ever shrinks the recognized length.
fn recover_end(path: &Path, format: WireFormat, cycle_start_millis: i64) -> ProbeResult<u64> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len() as usize;
    let mut mmap = unsafe { MmapMut::map_mut(&file)? };

    if format == WireFormat::Compressed {
        let actual = decode_compressed_header(&mmap[..len.min(format.header_size())])?;
        if actual != cycle_start_millis {
            return Err(ProbeError::corruption(format!(
                "cycle start mismatch in {}: header {}, requested {}",
                path.display(),
                actual,
                cycle_start_millis
            )));
        }
    }

    let end = scan_data_end(&mmap[..len], format);
    if end < len {
        mmap[end..].fill(0);
        mmap.flush()?;
    }
    Ok(end as u64)
}
