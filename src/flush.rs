//! Background flush scheduling.
//!
//! One thread per process amortizes flush visibility across every live
//! instrumented queue. Registrations carry a deadline; the worker keeps a
//! min-heap ordered by deadline, blocks on its command channel while idle,
//! and busy-waits only when the next deadline is imminent.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, warn};

use crate::config::{Clock, SpinConfig, SystemClock};
use crate::error::{ProbeError, ProbeResult};

/// Deadlines closer than this are busy-waited instead of slept, trading CPU
/// for flush latency.
const SPIN_WAIT_THRESHOLD_MS: i64 = 2;

/// Outcome of a single flush attempt on a registered target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushAttempt {
    /// Buffered probes were made visible.
    Flushed,
    /// A producer holds the busy state; retry shortly.
    Busy,
    /// The target closed; drop the registration.
    Closed,
}

/// Implemented by instrumented queues so the scheduler can force their
/// buffered probes to become visible. Flush and write are mutually exclusive
/// per instance; implementations must never block.
pub trait Flushable: Send + Sync {
    fn try_flush(&self) -> FlushAttempt;
}

struct Registration {
    deadline_millis: i64,
    interval_millis: u64,
    target: Weak<dyn Flushable>,
}

impl PartialEq for Registration {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_millis == other.deadline_millis
    }
}

impl Eq for Registration {}

impl PartialOrd for Registration {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Registration {
    // Reversed: BinaryHeap is a max-heap, the earliest deadline must win.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline_millis.cmp(&self.deadline_millis)
    }
}

enum FlushCommand {
    Register {
        target: Weak<dyn Flushable>,
        interval_millis: u64,
    },
    Shutdown,
}

/// Counters published by the flush worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushMetricsSnapshot {
    pub scheduled_flushes: u64,
    pub retry_attempts: u64,
    pub reschedules: u64,
    pub dropped_registrations: u64,
}

#[derive(Default)]
pub struct FlushMetrics {
    scheduled_flushes: AtomicU64,
    retry_attempts: AtomicU64,
    reschedules: AtomicU64,
    dropped_registrations: AtomicU64,
}

impl FlushMetrics {
    #[inline]
    fn incr_scheduled(&self) {
        self.scheduled_flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn incr_retry(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn incr_reschedule(&self) {
        self.reschedules.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn incr_dropped(&self) {
        self.dropped_registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FlushMetricsSnapshot {
        FlushMetricsSnapshot {
            scheduled_flushes: self.scheduled_flushes.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            reschedules: self.reschedules.load(Ordering::Relaxed),
            dropped_registrations: self.dropped_registrations.load(Ordering::Relaxed),
        }
    }
}

/// Single background thread that periodically forces each registered log's
/// buffered probes to become visible.
pub struct FlushScheduler {
    command_tx: Sender<FlushCommand>,
    metrics: Arc<FlushMetrics>,
}

impl FlushScheduler {
    pub fn new(spin: SpinConfig) -> Arc<Self> {
        Self::with_clock(spin, Arc::new(SystemClock))
    }

    pub fn with_clock(spin: SpinConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let (tx, rx) = unbounded();
        let metrics = Arc::new(FlushMetrics::default());
        let worker_metrics = metrics.clone();
        let _ = thread::Builder::new()
            .name("probe-flush".to_string())
            .spawn(move || worker_loop(rx, worker_metrics, spin, clock));
        Arc::new(Self {
            command_tx: tx,
            metrics,
        })
    }

    /// Registers a queue for periodic flushing. The registration dies with
    /// the target: the scheduler holds only a weak handle and always flushes
    /// through the owning instance's synchronized entry point. Deadlines are
    /// computed by the worker from the scheduler's own clock, so registrants
    /// with divergent clocks still flush on this scheduler's timeline.
    pub fn register(&self, target: Weak<dyn Flushable>, interval_millis: u64) -> ProbeResult<()> {
        self.command_tx
            .try_send(FlushCommand::Register {
                target,
                interval_millis,
            })
            .map_err(|err| match err {
                TrySendError::Full(_) | TrySendError::Disconnected(_) => {
                    ProbeError::invalid_state("flush scheduler stopped")
                }
            })
    }

    pub fn metrics(&self) -> FlushMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        let _ = self.command_tx.send(FlushCommand::Shutdown);
    }
}

fn worker_loop(
    rx: Receiver<FlushCommand>,
    metrics: Arc<FlushMetrics>,
    spin: SpinConfig,
    clock: Arc<dyn Clock>,
) {
    let mut heap: BinaryHeap<Registration> = BinaryHeap::new();
    // Deadlines live entirely in this worker's clock domain.
    let admit = |target: Weak<dyn Flushable>, interval_millis: u64, clock: &dyn Clock| {
        Registration {
            deadline_millis: clock.now_millis() + interval_millis as i64,
            interval_millis,
            target,
        }
    };
    loop {
        let Some(next_deadline) = heap.peek().map(|r| r.deadline_millis) else {
            // Idle: block until a registration arrives or shutdown.
            match rx.recv() {
                Ok(FlushCommand::Register {
                    target,
                    interval_millis,
                }) => heap.push(admit(target, interval_millis, clock.as_ref())),
                Ok(FlushCommand::Shutdown) | Err(_) => break,
            }
            continue;
        };

        let wait = next_deadline - clock.now_millis();
        if wait > SPIN_WAIT_THRESHOLD_MS {
            match rx.recv_timeout(Duration::from_millis(wait as u64)) {
                Ok(FlushCommand::Register {
                    target,
                    interval_millis,
                }) => {
                    heap.push(admit(target, interval_millis, clock.as_ref()));
                    continue;
                }
                Ok(FlushCommand::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else if wait > 0 {
            // Near-due: busy-wait, still draining commands.
            let mut stop = false;
            while clock.now_millis() < next_deadline {
                match rx.try_recv() {
                    Ok(FlushCommand::Register {
                        target,
                        interval_millis,
                    }) => heap.push(admit(target, interval_millis, clock.as_ref())),
                    Ok(FlushCommand::Shutdown) => {
                        stop = true;
                        break;
                    }
                    Err(_) => std::hint::spin_loop(),
                }
            }
            if stop {
                break;
            }
            // A fresh registration may now be due earlier.
            continue;
        }

        let Some(registration) = heap.pop() else {
            continue;
        };
        let Some(target) = registration.target.upgrade() else {
            metrics.incr_dropped();
            continue;
        };

        let mut attempts = 0u32;
        loop {
            match target.try_flush() {
                FlushAttempt::Flushed => {
                    metrics.incr_scheduled();
                    heap.push(Registration {
                        deadline_millis: clock.now_millis()
                            + registration.interval_millis as i64,
                        ..registration
                    });
                    break;
                }
                FlushAttempt::Closed => {
                    debug!("dropping flush registration for closed queue");
                    metrics.incr_dropped();
                    break;
                }
                FlushAttempt::Busy => {
                    attempts += 1;
                    metrics.incr_retry();
                    if attempts >= spin.max_flush_attempts {
                        // Reschedule by a full interval rather than starve
                        // other registrations.
                        warn!(attempts, "flush target stayed busy, rescheduling");
                        metrics.incr_reschedule();
                        heap.push(Registration {
                            deadline_millis: clock.now_millis()
                                + registration.interval_millis as i64,
                            ..registration
                        });
                        break;
                    }
                    spin_pause(spin.spin_wait_nanos);
                }
            }
        }
    }
}

/// Pauses for roughly `nanos` without yielding the CPU. Sub-microsecond
/// pauses are far below sleep granularity, so this busy-waits against a
/// monotonic deadline instead.
#[inline]
pub(crate) fn spin_pause(nanos: u64) {
    if nanos == 0 {
        std::hint::spin_loop();
        return;
    }
    let deadline = Instant::now() + Duration::from_nanos(nanos);
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}
