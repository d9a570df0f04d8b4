//! Replay tailer for probe log files.
//!
//! A `ProbeReader` opens its own read-only mapping of a cycle file and
//! delivers decoded probes to a [`ProbeConsumer`] in write order. It can run
//! while a writer is still appending: it only ever trusts data up to the
//! recovered end-of-data boundary, remapping when the file grows. The end of
//! valid data is always record-aligned, so the reader never sees a torn
//! record.
//!
//! A reader is single-threaded state. Ownership may be handed between
//! threads, but two threads must never drive the same reader at once.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use crate::error::{ProbeError, ProbeResult};
use crate::format::{decode_compressed_header, Probe, WireFormat};
use crate::fs::CycleFileName;
use crate::log::scan_data_end;

/// Receives decoded probes in order.
pub trait ProbeConsumer {
    fn on_probe(&mut self, probe: Probe);
    /// Called once when the reader is closed.
    fn on_close(&mut self) {}
}

impl<F: FnMut(Probe)> ProbeConsumer for F {
    fn on_probe(&mut self, probe: Probe) {
        self(probe);
    }
}

/// Sequential reader over one cycle file.
pub struct ProbeReader {
    path: PathBuf,
    mmap: Mmap,
    /// Bytes of the mapping backed by the file right now. The writer may
    /// truncate the zero tail on close, leaving the mapping longer than the
    /// file; touching those pages would fault.
    valid_len: usize,
    format: WireFormat,
    cycle_start_millis: i64,
    /// Next unread byte offset within the file.
    position: usize,
    closed: bool,
}

impl ProbeReader {
    /// Opens the cycle file for `cycle_start_millis` derived from `base`,
    /// the same base path the writer was configured with.
    pub fn open_cycle(
        base: &Path,
        format: WireFormat,
        cycle_start_millis: i64,
    ) -> ProbeResult<Self> {
        let path = CycleFileName::new(cycle_start_millis).resolve(base);
        Self::open(&path, format, cycle_start_millis)
    }

    /// Opens an explicit cycle file.
    pub fn open(path: &Path, format: WireFormat, cycle_start_millis: i64) -> ProbeResult<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if format == WireFormat::Compressed {
            let actual = decode_compressed_header(&mmap[..mmap.len().min(format.header_size())])?;
            if actual != cycle_start_millis {
                return Err(ProbeError::corruption(format!(
                    "cycle start mismatch in {}: header {}, requested {}",
                    path.display(),
                    actual,
                    cycle_start_millis
                )));
            }
        }
        let valid_len = mmap.len();
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            valid_len,
            format,
            cycle_start_millis,
            position: format.header_size(),
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// End of valid data in the current mapping. Record-aligned. Never
    /// touches pages past the file's current length.
    fn data_end(&self) -> usize {
        scan_data_end(&self.mmap[..self.valid_len], self.format)
    }

    /// Remaps whenever the file length changed, keeping `position` intact.
    /// Growth means the writer appended past the window; shrinkage means the
    /// writer closed and trimmed the zero tail.
    fn refresh(&mut self) -> ProbeResult<()> {
        let file = File::open(&self.path)?;
        let len = file.metadata()?.len() as usize;
        if len != self.mmap.len() && len > 0 {
            debug!(path = %self.path.display(), len, "remapping resized probe log");
            self.mmap = unsafe { Mmap::map(&file)? };
        }
        self.valid_len = len.min(self.mmap.len());
        Ok(())
    }

    /// Delivers up to `amount` probes to `consumer`, returning how many were
    /// delivered. Zero means the reader is caught up with the writer.
    pub fn read(&mut self, amount: usize, consumer: &mut dyn ProbeConsumer) -> ProbeResult<usize> {
        if self.closed {
            return Err(ProbeError::invalid_state("reader is closed"));
        }
        self.refresh()?;
        let record = self.format.record_size();
        let end = self.data_end();
        let mut delivered = 0usize;
        let mut probe = Probe::default();
        while delivered < amount && self.position + record <= end {
            self.format.decode(
                &self.mmap[self.position..self.position + record],
                self.cycle_start_millis,
                &mut probe,
            );
            consumer.on_probe(probe);
            self.position += record;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Drains every currently visible probe.
    pub fn read_all(&mut self, consumer: &mut dyn ProbeConsumer) -> ProbeResult<usize> {
        self.read(usize::MAX, consumer)
    }

    /// Rewinds to the first record; the next read replays everything.
    pub fn read_from_start(&mut self) {
        self.position = self.format.header_size();
    }

    /// Number of complete unread records currently visible, without
    /// consuming them. Diagnostic; costs a boundary scan, keep it out of hot
    /// loops.
    pub fn probes(&mut self) -> ProbeResult<usize> {
        self.refresh()?;
        Ok(self.data_end().saturating_sub(self.position) / self.format.record_size())
    }

    /// Signals end of replay to `consumer`. Further reads fail with
    /// `InvalidState`.
    pub fn close(&mut self, consumer: &mut dyn ProbeConsumer) {
        if self.closed {
            return;
        }
        self.closed = true;
        consumer.on_close();
    }
}

impl fmt::Debug for ProbeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeReader")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("cycle_start_millis", &self.cycle_start_millis)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}
