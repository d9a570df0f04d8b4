//! The single unsafe access point for memory-mapped log windows.
//!
//! All raw pointer arithmetic over the mapping lives here, bounds-checked
//! once. Callers see only `write_bytes`/`read_slice`/`flush`/`remap`.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::error::{ProbeError, ProbeResult};
use crate::fs::open_log_file;

/// One writable memory-mapped window over a backing file.
///
/// The mapping itself sits behind a mutex that is only taken for flush and
/// remap; the hot path goes through the published data pointer. Exclusive
/// write access is the caller's responsibility (the busy-state protocol of
/// the owning queue), mirroring how the write cursor is managed.
pub struct MappedRegion {
    path: PathBuf,
    mmap: Mutex<MmapMut>,
    data: AtomicPtr<u8>,
    capacity: u32,
    file_offset: AtomicU64,
}

// SAFETY: the raw pointer targets mapped file memory that lives as long as
// the MmapMut held in the mutex; bounds are checked on every access and the
// pointer is only republished under the mutex during remap.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("file_offset", &self.file_offset())
            .finish()
    }
}

impl MappedRegion {
    /// Maps `capacity` bytes of `path` starting at `file_offset`, extending
    /// the file as needed. Offsets need not be page-aligned; memmap2 aligns
    /// internally.
    pub fn map(path: &Path, file_offset: u64, capacity: u32) -> ProbeResult<Self> {
        let file = open_log_file(path, file_offset + capacity as u64)?;
        let mut mmap = unsafe {
            MmapOptions::new()
                .offset(file_offset)
                .len(capacity as usize)
                .map_mut(&file)?
        };
        let data_ptr = mmap.as_mut_ptr();
        Ok(Self {
            path: path.to_path_buf(),
            mmap: Mutex::new(mmap),
            data: AtomicPtr::new(data_ptr),
            capacity,
            file_offset: AtomicU64::new(file_offset),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Byte offset of this window within the backing file.
    #[inline]
    pub fn file_offset(&self) -> u64 {
        self.file_offset.load(Ordering::Acquire)
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> ProbeResult<()> {
        if offset + bytes.len() > self.capacity as usize {
            return Err(ProbeError::OutOfBounds {
                offset,
                len: bytes.len(),
                capacity: self.capacity as usize,
            });
        }
        let ptr = self.data.load(Ordering::Acquire);
        if ptr.is_null() {
            return Err(ProbeError::invalid_state("region memory unmapped"));
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    pub fn read_slice(&self, offset: usize, len: usize) -> ProbeResult<&[u8]> {
        if offset + len > self.capacity as usize {
            return Err(ProbeError::OutOfBounds {
                offset,
                len,
                capacity: self.capacity as usize,
            });
        }
        let ptr = self.data.load(Ordering::Acquire);
        if ptr.is_null() {
            return Err(ProbeError::invalid_state("region memory unmapped"));
        }
        unsafe { Ok(slice::from_raw_parts(ptr.add(offset), len)) }
    }

    /// Makes buffered writes visible to co-located readers of the same file.
    pub fn flush(&self) -> ProbeResult<()> {
        let guard = self.mmap.lock();
        guard.flush()?;
        Ok(())
    }

    /// Flushes and then fsync-equivalents the backing file.
    pub fn flush_and_sync(&self) -> ProbeResult<()> {
        self.flush()?;
        self.sync_file()
    }

    fn sync_file(&self) -> ProbeResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        match file.sync_data() {
            Ok(()) => Ok(()),
            Err(err) if sync_data_unsupported(&err) => {
                file.sync_all()?;
                Ok(())
            }
            Err(err) => Err(ProbeError::from(err)),
        }
    }

    /// Replaces the window with a fresh one of the same capacity starting at
    /// `new_file_offset`, extending the backing file. In-flight writes are
    /// excluded by the caller's resize lock.
    pub fn remap(&self, new_file_offset: u64) -> ProbeResult<()> {
        let file = open_log_file(&self.path, new_file_offset + self.capacity as u64)?;
        let mut mmap = unsafe {
            MmapOptions::new()
                .offset(new_file_offset)
                .len(self.capacity as usize)
                .map_mut(&file)?
        };
        let ptr = mmap.as_mut_ptr();

        let mut guard = self.mmap.lock();
        guard.flush()?;
        *guard = mmap;
        self.data.store(ptr, Ordering::Release);
        self.file_offset.store(new_file_offset, Ordering::Release);
        Ok(())
    }
}

fn sync_data_unsupported(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::Unsupported) {
        return true;
    }
    if let Some(code) = err.raw_os_error() {
        if code == libc::ENOSYS || code == libc::EINVAL || code == libc::ENOTSUP {
            return true;
        }
        if cfg!(windows) && code == 1 {
            // ERROR_INVALID_FUNCTION: treat as fdatasync unsupported and fall back to fsync.
            return true;
        }
    }
    false
}
