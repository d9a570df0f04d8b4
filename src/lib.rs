//! Probe persistence engine for instrumented FIFO queues.
//!
//! The crate wraps arbitrary queue collections so every mutating operation
//! emits a `(size, timestamp)` probe into a durable, memory-mapped,
//! append-only log. A shared background scheduler amortizes flushing across
//! instances, crash recovery locates the end of valid data by scanning raw
//! bytes, and a replay tailer reconstructs the size-over-time curve for
//! consumers such as dashboards or exporters.

pub mod config;
pub mod error;
pub mod flush;
pub mod format;
pub mod fs;
pub mod log;
pub mod queue;
pub mod reader;
pub mod region;
pub mod registry;

pub use config::{
    BatchConfig, Clock, ManualClock, ProbeConfig, ProbeHooks, SpinConfig, SystemClock,
    WriteThreshold,
};
pub use error::{ProbeError, ProbeResult};
pub use format::{Probe, WireFormat};
pub use fs::{CycleFileName, PROBE_FILE_EXTENSION};
pub use log::{ProbeLog, WriteOutcome};
pub use queue::{Concurrent, Fifo, InstrumentedQueue, QueueState, SingleProducer, SyncMode};
pub use reader::{ProbeConsumer, ProbeReader};
pub use registry::PathRegistry;

pub use flush::{FlushScheduler, Flushable};
use flush::FlushMetricsSnapshot;

/// Named metric sample produced by the flush pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushMetricSample {
    pub name: &'static str,
    pub value: u64,
}

/// Helper for exporting flush metrics snapshots with stable metric names.
#[derive(Debug, Clone, Copy)]
pub struct FlushMetricsExporter {
    snapshot: FlushMetricsSnapshot,
}

impl FlushMetricsExporter {
    pub fn new(snapshot: FlushMetricsSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn scheduled_flushes(&self) -> u64 {
        self.snapshot.scheduled_flushes
    }

    pub fn retry_attempts(&self) -> u64 {
        self.snapshot.retry_attempts
    }

    pub fn reschedules(&self) -> u64 {
        self.snapshot.reschedules
    }

    pub fn dropped_registrations(&self) -> u64 {
        self.snapshot.dropped_registrations
    }

    pub fn samples(&self) -> impl Iterator<Item = FlushMetricSample> {
        const METRIC_NAMES: [(&str, fn(&FlushMetricsSnapshot) -> u64); 4] = [
            ("probe_flush_scheduled_total", |s| s.scheduled_flushes),
            ("probe_flush_retry_attempts_total", |s| s.retry_attempts),
            ("probe_flush_reschedules_total", |s| s.reschedules),
            ("probe_flush_dropped_registrations_total", |s| {
                s.dropped_registrations
            }),
        ];
        let snapshot = self.snapshot;
        METRIC_NAMES
            .into_iter()
            .map(move |(name, accessor)| FlushMetricSample {
                name,
                value: accessor(&snapshot),
            })
    }

    pub fn emit<F>(&self, mut writer: F)
    where
        F: FnMut(FlushMetricSample),
    {
        for sample in self.samples() {
            writer(sample);
        }
    }
}
