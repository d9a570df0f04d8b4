use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ProbeError;

/// Smallest flush interval an instrumented queue may be configured with
/// (milliseconds). Below this the flush thread degenerates into a busy loop
/// across every registered queue.
pub const MIN_FLUSH_INTERVAL_MS: u64 = 10;

/// Smallest roll cycle duration (milliseconds). One file per cycle; cycles
/// shorter than a minute produce pathological file churn.
pub const MIN_CYCLE_DURATION_MS: u64 = 60_000;

/// Default mapped window size (1 MiB).
const DEFAULT_MMAP_SIZE_BYTES: u64 = 1024 * 1024;

/// Default roll cycle duration: one file per day.
const DEFAULT_CYCLE_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

/// Default number of encoded probes buffered before a bulk write into the
/// mapped region.
const DEFAULT_BATCH_CAPACITY: usize = 128;

/// Default maximum staleness before the flush scheduler forces buffered
/// probes to become visible (milliseconds).
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;

/// Default bound on waiting for a close-in-progress to release a path
/// registration (milliseconds).
const DEFAULT_REGISTRY_TIMEOUT_MS: u64 = 5_000;

/// Returns the operating system page size in bytes.
pub fn page_size() -> u64 {
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 { 4096 } else { value as u64 }
}

/// Millisecond clock abstraction so roll cycles and sampling decisions are
/// testable without sleeping.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall-clock time since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::ZERO)
            .as_millis() as i64
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: std::sync::atomic::AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: std::sync::atomic::AtomicI64::new(now_millis),
        }
    }

    pub fn advance(&self, millis: i64) {
        self.now
            .fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Sampling policy: a probe is emitted only if enough time elapsed since the
/// last emission or the size moved far enough.
///
/// The policy is monotonic: relaxing either bound only increases emission
/// frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteThreshold {
    /// Minimum elapsed milliseconds since the last emitted probe.
    pub min_delay_millis: u64,
    /// Minimum absolute size change since the last emitted probe.
    pub min_size_delta: u64,
}

impl Default for WriteThreshold {
    fn default() -> Self {
        Self {
            min_delay_millis: 0,
            min_size_delta: 1,
        }
    }
}

impl WriteThreshold {
    /// Decides whether a probe with the given elapsed time and size delta is
    /// worth persisting.
    #[inline]
    pub fn accepts(&self, elapsed_millis: i64, size_delta: i64) -> bool {
        elapsed_millis >= self.min_delay_millis as i64
            || size_delta.unsigned_abs() >= self.min_size_delta
    }
}

/// Batch buffer sizing and flush staleness bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Encoded probes accumulated before a single bulk write into the
    /// mapped region.
    pub batch_capacity_probes: usize,
    /// Maximum milliseconds buffered probes may stay invisible before the
    /// flush scheduler forces them out.
    pub flush_interval_millis: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_capacity_probes: DEFAULT_BATCH_CAPACITY,
            flush_interval_millis: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

/// Bounded busy-wait knobs for the lock-free hot path.
///
/// Backpressure on the write path is resolved by shedding telemetry after
/// these bounds, never by blocking the caller's queue operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinConfig {
    /// Attempts to acquire the busy state before a producer drops its probe.
    pub max_write_attempts: u32,
    /// Attempts the flush scheduler makes before rescheduling a queue by a
    /// full interval.
    pub max_flush_attempts: u32,
    /// Pause between attempts, in nanoseconds.
    pub spin_wait_nanos: u64,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            max_write_attempts: 64,
            max_flush_attempts: 5,
            spin_wait_nanos: 100,
        }
    }
}

/// Primary configuration surface for an instrumented queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Backing log path. The actual cycle files are named
    /// `<stem>-<cycle_start_millis>.qprobe` next to this path.
    pub path: PathBuf,
    /// Size of one mapped window. Must be at least the OS page size; the
    /// batch buffer must fit inside one window.
    pub mmap_size_bytes: u64,
    /// Duration of one roll cycle; a new backing file is opened per cycle.
    pub cycle_duration_millis: u64,
    /// Use the 12-byte absolute-timestamp format instead of the 8-byte
    /// delta format.
    pub disable_compression: bool,
    /// Sampling policy consulted before every emission.
    pub threshold: WriteThreshold,
    /// Batch buffer sizing.
    pub batch: BatchConfig,
    /// Busy-wait bounds.
    pub spin: SpinConfig,
    /// Bound on waiting for a close-in-progress to release this path.
    pub registry_timeout_millis: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./probes/queue.qprobe"),
            mmap_size_bytes: DEFAULT_MMAP_SIZE_BYTES,
            cycle_duration_millis: DEFAULT_CYCLE_DURATION_MS,
            disable_compression: false,
            threshold: WriteThreshold::default(),
            batch: BatchConfig::default(),
            spin: SpinConfig::default(),
            registry_timeout_millis: DEFAULT_REGISTRY_TIMEOUT_MS,
        }
    }
}

impl ProbeConfig {
    /// Returns a copy with the mapped window size aligned up to a whole
    /// number of pages and zero spin bounds bumped to one attempt.
    pub fn normalized(mut self) -> Self {
        let page = page_size();
        let remainder = self.mmap_size_bytes % page;
        if remainder != 0 {
            self.mmap_size_bytes += page - remainder;
        }
        if self.spin.max_write_attempts == 0 {
            self.spin.max_write_attempts = 1;
        }
        if self.spin.max_flush_attempts == 0 {
            self.spin.max_flush_attempts = 1;
        }
        self
    }

    /// Validates the construction-time constraints. Violations are fatal.
    pub fn validate(&self) -> Result<(), ProbeError> {
        let page = page_size();
        if self.mmap_size_bytes < page {
            return Err(ProbeError::invalid_config(format!(
                "mmap size {} below page size {}",
                self.mmap_size_bytes, page
            )));
        }
        if self.mmap_size_bytes > u32::MAX as u64 {
            return Err(ProbeError::invalid_config(format!(
                "mmap size {} exceeds the 4 GiB window limit",
                self.mmap_size_bytes
            )));
        }
        if self.batch.batch_capacity_probes < 1 {
            return Err(ProbeError::invalid_config("batch capacity must be >= 1"));
        }
        if self.batch.flush_interval_millis < MIN_FLUSH_INTERVAL_MS {
            return Err(ProbeError::invalid_config(format!(
                "flush interval {} ms below minimum {} ms",
                self.batch.flush_interval_millis, MIN_FLUSH_INTERVAL_MS
            )));
        }
        if self.cycle_duration_millis < MIN_CYCLE_DURATION_MS {
            return Err(ProbeError::invalid_config(format!(
                "cycle duration {} ms below minimum {} ms",
                self.cycle_duration_millis, MIN_CYCLE_DURATION_MS
            )));
        }
        let record = if self.disable_compression { 12 } else { 8 };
        let batch_bytes = self.batch.batch_capacity_probes as u64 * record;
        if batch_bytes > self.mmap_size_bytes {
            return Err(ProbeError::invalid_config(format!(
                "batch of {} bytes does not fit one {} byte window",
                batch_bytes, self.mmap_size_bytes
            )));
        }
        Ok(())
    }
}

impl Display for ProbeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProbeConfig(path={:?}, mmap_size_bytes={}, cycle_duration_millis={}, disable_compression={}, min_delay_millis={}, min_size_delta={}, batch_capacity_probes={}, flush_interval_millis={}, registry_timeout_millis={})",
            self.path,
            self.mmap_size_bytes,
            self.cycle_duration_millis,
            self.disable_compression,
            self.threshold.min_delay_millis,
            self.threshold.min_size_delta,
            self.batch.batch_capacity_probes,
            self.batch.flush_interval_millis,
            self.registry_timeout_millis
        )
    }
}

/// Non-serializable collaborators supplied alongside [`ProbeConfig`].
#[derive(Clone)]
pub struct ProbeHooks {
    /// Consulted after the threshold; returning false suppresses the probe.
    pub write_filter: Option<Arc<dyn Fn(i64, i64) -> bool + Send + Sync>>,
    /// Invoked for instrumentation failures. Returning true closes the
    /// instance; false continues best-effort.
    pub error_handler: Option<Arc<dyn Fn(&ProbeError) -> bool + Send + Sync>>,
    /// Millisecond clock.
    pub clock: Arc<dyn Clock>,
}

impl Default for ProbeHooks {
    fn default() -> Self {
        Self {
            write_filter: None,
            error_handler: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl Debug for ProbeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeHooks")
            .field("write_filter", &self.write_filter.is_some())
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = ProbeConfig::default().normalized();
        cfg.validate().expect("default config valid");
        assert_eq!(cfg.mmap_size_bytes % page_size(), 0);
    }

    #[test]
    fn rejects_small_mmap() {
        let cfg = ProbeConfig {
            mmap_size_bytes: 16,
            ..ProbeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ProbeError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_short_flush_interval() {
        let mut cfg = ProbeConfig::default();
        cfg.batch.flush_interval_millis = 5;
        assert!(matches!(cfg.validate(), Err(ProbeError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_short_cycle() {
        let cfg = ProbeConfig {
            cycle_duration_millis: 1_000,
            ..ProbeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ProbeError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_batch_larger_than_window() {
        let mut cfg = ProbeConfig::default().normalized();
        cfg.batch.batch_capacity_probes = (cfg.mmap_size_bytes as usize / 8) + 1;
        assert!(matches!(cfg.validate(), Err(ProbeError::InvalidConfig(_))));
    }

    #[test]
    fn threshold_is_monotonic() {
        let strict = WriteThreshold {
            min_delay_millis: 5_000,
            min_size_delta: 2,
        };
        let relaxed = WriteThreshold {
            min_delay_millis: 1_000,
            min_size_delta: 1,
        };
        for (elapsed, delta) in [(0_i64, 1_i64), (0, 2), (4_999, 1), (5_000, 0), (6_000, 3)] {
            if strict.accepts(elapsed, delta) {
                assert!(relaxed.accepts(elapsed, delta));
            }
        }
    }

    #[test]
    fn threshold_accepts_negative_delta_by_magnitude() {
        let threshold = WriteThreshold {
            min_delay_millis: 60_000,
            min_size_delta: 3,
        };
        assert!(threshold.accepts(0, -3));
        assert!(!threshold.accepts(0, -2));
    }

    #[test]
    fn serde_round_trip() {
        let cfg = ProbeConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let decoded: ProbeConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_millis(), 1_250);
    }
}
