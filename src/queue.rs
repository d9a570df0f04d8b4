//! Instrumented queue decorator.
//!
//! Wraps a caller-supplied FIFO collection, forwarding every operation to it
//! unconditionally and then conditionally emitting a `(size, timestamp)`
//! probe into a memory-mapped log. Instrumentation failures never surface
//! from the wrapped queue's operations; telemetry is shed, never the
//! caller's data.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::queue::{ArrayQueue, SegQueue};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::config::{ProbeConfig, ProbeHooks};
use crate::error::{ProbeError, ProbeResult};
use crate::flush::{spin_pause, FlushAttempt, FlushScheduler, Flushable};
use crate::format::WireFormat;
use crate::fs::CycleFileName;
use crate::log::{ProbeLog, WriteOutcome};
use crate::registry::PathRegistry;

/// Per-instance lifecycle. Producer threads cycle Free↔Busy around each
/// write; close transitions to Closing exactly once and Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueState {
    Free = 0,
    Busy = 1,
    Closing = 2,
    Closed = 3,
}

impl QueueState {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => QueueState::Free,
            1 => QueueState::Busy,
            2 => QueueState::Closing,
            _ => QueueState::Closed,
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Concurrent {}
    impl Sealed for super::SingleProducer {}
}

/// Atomicity strategy for the state machine and size counter: one generic
/// queue implementation, two synchronization disciplines chosen at the type
/// level.
pub trait SyncMode: sealed::Sealed + Send + Sync + 'static {
    fn try_transition(state: &AtomicU8, from: QueueState, to: QueueState) -> bool;
    fn store_state(state: &AtomicU8, to: QueueState);
    fn load_state(state: &AtomicU8) -> QueueState;
    fn counter_add(counter: &AtomicI64, delta: i64) -> i64;
    fn counter_store(counter: &AtomicI64, value: i64);
    fn counter_load(counter: &AtomicI64) -> i64;
}

/// CAS-based transitions and counters for multi-producer use.
#[derive(Debug, Default, Clone, Copy)]
pub struct Concurrent;

impl SyncMode for Concurrent {
    #[inline]
    fn try_transition(state: &AtomicU8, from: QueueState, to: QueueState) -> bool {
        state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    fn store_state(state: &AtomicU8, to: QueueState) {
        state.store(to as u8, Ordering::Release);
    }

    #[inline]
    fn load_state(state: &AtomicU8) -> QueueState {
        QueueState::from_u8(state.load(Ordering::Acquire))
    }

    #[inline]
    fn counter_add(counter: &AtomicI64, delta: i64) -> i64 {
        counter.fetch_add(delta, Ordering::AcqRel) + delta
    }

    #[inline]
    fn counter_store(counter: &AtomicI64, value: i64) {
        counter.store(value, Ordering::Release);
    }

    #[inline]
    fn counter_load(counter: &AtomicI64) -> i64 {
        counter.load(Ordering::Acquire)
    }
}

/// Unconditional check-then-set transitions for single-producer use: no CAS
/// retry protocol on the hot path. Acquire/release ordering is kept so the
/// flush thread still observes a coherent batch buffer; only the contention
/// protocol is dropped, not the memory fences.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProducer;

impl SyncMode for SingleProducer {
    #[inline]
    fn try_transition(state: &AtomicU8, from: QueueState, to: QueueState) -> bool {
        if state.load(Ordering::Acquire) == from as u8 {
            state.store(to as u8, Ordering::Release);
            true
        } else {
            false
        }
    }

    #[inline]
    fn store_state(state: &AtomicU8, to: QueueState) {
        state.store(to as u8, Ordering::Release);
    }

    #[inline]
    fn load_state(state: &AtomicU8) -> QueueState {
        QueueState::from_u8(state.load(Ordering::Acquire))
    }

    #[inline]
    fn counter_add(counter: &AtomicI64, delta: i64) -> i64 {
        let next = counter.load(Ordering::Relaxed) + delta;
        counter.store(next, Ordering::Relaxed);
        next
    }

    #[inline]
    fn counter_store(counter: &AtomicI64, value: i64) {
        counter.store(value, Ordering::Relaxed);
    }

    #[inline]
    fn counter_load(counter: &AtomicI64) -> i64 {
        counter.load(Ordering::Relaxed)
    }
}

/// FIFO collections the decorator can wrap. Mutation goes through `&self`;
/// the inner queue supplies its own thread-safety discipline.
pub trait Fifo<T> {
    /// Attempts to enqueue; returns false if the queue rejected the item
    /// (bounded queue full).
    fn offer(&self, item: T) -> bool;
    fn poll(&self) -> Option<T>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn clear(&self);
}

impl<T> Fifo<T> for SegQueue<T> {
    fn offer(&self, item: T) -> bool {
        self.push(item);
        true
    }

    fn poll(&self) -> Option<T> {
        self.pop()
    }

    fn len(&self) -> usize {
        SegQueue::len(self)
    }

    fn clear(&self) {
        while self.pop().is_some() {}
    }
}

impl<T> Fifo<T> for ArrayQueue<T> {
    fn offer(&self, item: T) -> bool {
        self.push(item).is_ok()
    }

    fn poll(&self) -> Option<T> {
        self.pop()
    }

    fn len(&self) -> usize {
        ArrayQueue::len(self)
    }

    fn clear(&self) {
        while self.pop().is_some() {}
    }
}

impl<T> Fifo<T> for Mutex<VecDeque<T>> {
    fn offer(&self, item: T) -> bool {
        self.lock().push_back(item);
        true
    }

    fn poll(&self) -> Option<T> {
        self.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// State owned exclusively by whichever thread holds Busy (or won Closing).
struct LogState {
    batch: Vec<u8>,
    log: ProbeLog,
}

struct ProbeCore<M: SyncMode> {
    state: AtomicU8,
    counter: AtomicI64,
    /// Timestamp of the last emitted probe; sampling elapsed-time input.
    last_probe_millis: AtomicI64,
    /// Counter value at the last sampling decision; sampling delta input.
    /// Sampling inputs tolerate races; only emission fidelity is affected.
    last_seen_count: AtomicI64,
    dropped_probes: AtomicU64,
    /// Set once by `close`; the thread that owns the state when the request
    /// lands runs the close body.
    close_requested: AtomicBool,
    inner: UnsafeCell<Option<LogState>>,
    config: ProbeConfig,
    hooks: ProbeHooks,
    registry: PathRegistry,
    registry_key: PathBuf,
    format: WireFormat,
    _mode: PhantomData<M>,
}

// SAFETY: `inner` is dereferenced only by the thread that currently holds
// the Busy state or won the transition to Closing; the acquire/release
// transitions order those accesses.
unsafe impl<M: SyncMode> Send for ProbeCore<M> {}
unsafe impl<M: SyncMode> Sync for ProbeCore<M> {}

impl<M: SyncMode> ProbeCore<M> {
    #[inline]
    fn state(&self) -> QueueState {
        M::load_state(&self.state)
    }

    /// Sampling + persistence after a successful inner-queue mutation.
    /// Never blocks: busy-wait exhaustion sheds the probe.
    fn after_mutation(&self) {
        if matches!(self.state(), QueueState::Closing | QueueState::Closed)
            || self.close_requested.load(Ordering::Acquire)
        {
            return;
        }
        let now = self.hooks.clock.now_millis();
        let count = M::counter_load(&self.counter);
        let elapsed = now - self.last_probe_millis.load(Ordering::Acquire);
        let delta = count - self.last_seen_count.load(Ordering::Acquire);
        self.last_seen_count.store(count, Ordering::Release);
        if !self.config.threshold.accepts(elapsed, delta) {
            return;
        }
        if let Some(filter) = &self.hooks.write_filter {
            if !filter(count, now) {
                return;
            }
        }

        let mut attempts = 0u32;
        while !M::try_transition(&self.state, QueueState::Free, QueueState::Busy) {
            if matches!(self.state(), QueueState::Closing | QueueState::Closed)
                || self.close_requested.load(Ordering::Acquire)
            {
                return;
            }
            attempts += 1;
            if attempts >= self.config.spin.max_write_attempts {
                self.dropped_probes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    path = %self.config.path.display(),
                    attempts,
                    "dropping probe: busy-wait exhausted"
                );
                return;
            }
            spin_pause(self.config.spin.spin_wait_nanos);
        }

        self.last_probe_millis.store(now, Ordering::Release);
        let result = self.emit_locked(count, now);
        self.release_busy();
        if let Err(err) = result {
            self.handle_error(err);
        }
    }

    fn emit_locked(&self, count: i64, now: i64) -> ProbeResult<()> {
        // SAFETY: Busy is held (see type invariant).
        let inner = unsafe { &mut *self.inner.get() };
        let Some(state) = inner.as_mut() else {
            return Ok(());
        };
        self.roll_if_due(state, now)?;

        let record = self.format.record_size();
        let start = state.batch.len();
        state.batch.resize(start + record, 0);
        let clamped = count.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        self.format.encode(
            clamped,
            now,
            state.log.cycle_start_millis(),
            &mut state.batch[start..],
        );
        if state.batch.len() >= self.config.batch.batch_capacity_probes * record {
            self.flush_batch_locked(state)?;
        }
        Ok(())
    }

    fn flush_batch_locked(&self, state: &mut LogState) -> ProbeResult<()> {
        if state.batch.is_empty() {
            return Ok(());
        }
        let probes = (state.batch.len() / self.format.record_size()) as u64;
        match state.log.append(&state.batch)? {
            WriteOutcome::Written => {}
            WriteOutcome::Dropped => {
                self.dropped_probes.fetch_add(probes, Ordering::Relaxed);
            }
        }
        state.batch.clear();
        Ok(())
    }

    /// Opens the next cycle file when the current cycle has elapsed. The
    /// prior cycle file becomes immutable.
    fn roll_if_due(&self, state: &mut LogState, now: i64) -> ProbeResult<()> {
        let duration = self.config.cycle_duration_millis as i64;
        if now < state.log.cycle_start_millis() + duration {
            return Ok(());
        }
        self.flush_batch_locked(state)?;
        let cycle_start = now - now.rem_euclid(duration);
        let path = CycleFileName::new(cycle_start).resolve(&self.config.path);
        let next = ProbeLog::open(
            &path,
            self.config.mmap_size_bytes as u32,
            self.format,
            cycle_start,
        )?;
        let prior = std::mem::replace(&mut state.log, next);
        if let Err(err) = prior.close() {
            warn!(error = %err, "failed to close rolled probe log");
        }
        Ok(())
    }

    fn handle_error(&self, err: ProbeError) {
        error!(error = %err, path = %self.config.path.display(), "probe instrumentation failure");
        // Without a handler the safe default is to stop instrumenting.
        let should_close = self
            .hooks
            .error_handler
            .as_ref()
            .map(|handler| handler(&err))
            .unwrap_or(true);
        if should_close {
            self.close();
        }
    }

    /// Idempotent, safe to call concurrently with writers. Exactly one
    /// thread runs the close body: this caller if it wins Free -> Closing,
    /// otherwise the current Busy holder when it releases. Closing is never
    /// taken from under a live Busy holder.
    fn close(&self) {
        self.close_requested.store(true, Ordering::Release);
        loop {
            if M::try_transition(&self.state, QueueState::Free, QueueState::Closing) {
                self.finish_close();
                return;
            }
            match self.state() {
                QueueState::Closing | QueueState::Closed => return,
                QueueState::Busy | QueueState::Free => {
                    spin_pause(self.config.spin.spin_wait_nanos);
                }
            }
        }
    }

    /// Releases Busy after an emit or flush. A pending close request is
    /// honored here, on the thread that legitimately owns the state.
    fn release_busy(&self) {
        if self.close_requested.load(Ordering::Acquire)
            && M::try_transition(&self.state, QueueState::Busy, QueueState::Closing)
        {
            self.finish_close();
            return;
        }
        let _ = M::try_transition(&self.state, QueueState::Busy, QueueState::Free);
    }

    fn finish_close(&self) {
        // SAFETY: we won the Closing transition; no writer holds Busy and
        // none can acquire it until Closed is published.
        let inner = unsafe { &mut *self.inner.get() };
        if let Some(mut state) = inner.take() {
            if let Err(err) = self.flush_batch_locked(&mut state) {
                warn!(error = %err, "failed to flush residual probes during close");
            }
            if let Err(err) = state.log.close() {
                warn!(error = %err, "failed to close probe log");
            }
        }
        self.registry.deregister(&self.registry_key);
        M::store_state(&self.state, QueueState::Closed);
    }

    fn is_closed(&self) -> bool {
        matches!(self.state(), QueueState::Closed)
    }
}

impl<M: SyncMode> Flushable for ProbeCore<M> {
    fn try_flush(&self) -> FlushAttempt {
        if matches!(self.state(), QueueState::Closing | QueueState::Closed)
            || self.close_requested.load(Ordering::Acquire)
        {
            return FlushAttempt::Closed;
        }
        if !M::try_transition(&self.state, QueueState::Free, QueueState::Busy) {
            return match self.state() {
                QueueState::Closing | QueueState::Closed => FlushAttempt::Closed,
                _ => FlushAttempt::Busy,
            };
        }
        let result = (|| {
            // SAFETY: Busy is held.
            let inner = unsafe { &mut *self.inner.get() };
            let Some(state) = inner.as_mut() else {
                return Ok(());
            };
            self.flush_batch_locked(state)?;
            state.log.flush()
        })();
        self.release_busy();
        if let Err(err) = result {
            self.handle_error(err);
            return match self.state() {
                QueueState::Closing | QueueState::Closed => FlushAttempt::Closed,
                _ => FlushAttempt::Busy,
            };
        }
        FlushAttempt::Flushed
    }
}

/// Transparent FIFO decorator that persists size probes.
///
/// Forward every operation to the wrapped queue first; only successful
/// mutations adjust the internal counter and may emit a probe. After
/// [`close`](Self::close) the wrapped queue keeps operating normally and all
/// further probes are no-ops.
pub struct InstrumentedQueue<T, Q: Fifo<T>, M: SyncMode = Concurrent> {
    inner: Q,
    core: Arc<ProbeCore<M>>,
    _item: PhantomData<fn(T) -> T>,
}

impl<T, Q: Fifo<T>, M: SyncMode> InstrumentedQueue<T, Q, M> {
    /// Wraps `queue`, claiming the configured path and registering with the
    /// flush scheduler.
    ///
    /// Fails with `InvalidConfig` for bad sizes/thresholds and with
    /// `PathConflict` when another live instance owns the same path.
    pub fn new(
        queue: Q,
        config: ProbeConfig,
        hooks: ProbeHooks,
        registry: PathRegistry,
        scheduler: &FlushScheduler,
    ) -> ProbeResult<Self> {
        let config = config.normalized();
        config.validate()?;
        let registry_key = registry.register(
            &config.path,
            Duration::from_millis(config.registry_timeout_millis),
        )?;

        let format = WireFormat::from_config(config.disable_compression);
        let now = hooks.clock.now_millis();
        let duration = config.cycle_duration_millis as i64;
        let cycle_start = now - now.rem_euclid(duration);
        let path = CycleFileName::new(cycle_start).resolve(&config.path);
        let log = match ProbeLog::open(&path, config.mmap_size_bytes as u32, format, cycle_start) {
            Ok(log) => log,
            Err(err) => {
                registry.deregister(&registry_key);
                return Err(err);
            }
        };

        let initial = queue.len() as i64;
        let batch_bytes = config.batch.batch_capacity_probes * format.record_size();
        let interval = config.batch.flush_interval_millis;
        let core = Arc::new(ProbeCore::<M> {
            state: AtomicU8::new(QueueState::Free as u8),
            counter: AtomicI64::new(initial),
            last_probe_millis: AtomicI64::new(now),
            last_seen_count: AtomicI64::new(initial),
            dropped_probes: AtomicU64::new(0),
            close_requested: AtomicBool::new(false),
            inner: UnsafeCell::new(Some(LogState {
                batch: Vec::with_capacity(batch_bytes),
                log,
            })),
            config,
            hooks,
            registry,
            registry_key,
            format,
            _mode: PhantomData,
        });

        let weak: Weak<dyn Flushable> = Arc::downgrade(&core) as Weak<dyn Flushable>;
        if let Err(err) = scheduler.register(weak, interval) {
            core.close();
            return Err(err);
        }

        Ok(Self {
            inner: queue,
            core,
            _item: PhantomData,
        })
    }

    /// Enqueues one item; emits a probe if the sampling policy accepts.
    pub fn offer(&self, item: T) -> bool {
        let added = self.inner.offer(item);
        if added {
            M::counter_add(&self.core.counter, 1);
            self.core.after_mutation();
        }
        added
    }

    /// Dequeues one item; emits a probe if the sampling policy accepts.
    pub fn poll(&self) -> Option<T> {
        let item = self.inner.poll();
        if item.is_some() {
            M::counter_add(&self.core.counter, -1);
            self.core.after_mutation();
        }
        item
    }

    /// Bulk enqueue; the counter moves by the number actually accepted and
    /// at most one probe is emitted.
    pub fn offer_all(&self, items: impl IntoIterator<Item = T>) -> usize {
        let mut accepted = 0i64;
        for item in items {
            if self.inner.offer(item) {
                accepted += 1;
            }
        }
        if accepted > 0 {
            M::counter_add(&self.core.counter, accepted);
            self.core.after_mutation();
        }
        accepted as usize
    }

    /// Bulk dequeue of up to `amount` items; at most one probe is emitted.
    pub fn poll_many(&self, amount: usize) -> Vec<T> {
        let mut items = Vec::new();
        while items.len() < amount {
            match self.inner.poll() {
                Some(item) => items.push(item),
                None => break,
            }
        }
        if !items.is_empty() {
            M::counter_add(&self.core.counter, -(items.len() as i64));
            self.core.after_mutation();
        }
        items
    }

    /// Empties the wrapped queue and resets the counter to its actual size.
    pub fn clear(&self) {
        self.inner.clear();
        M::counter_store(&self.core.counter, self.inner.len() as i64);
        self.core.after_mutation();
    }

    /// Re-reads the wrapped queue's size after an external bulk mutation.
    pub fn sync_size(&self) {
        M::counter_store(&self.core.counter, self.inner.len() as i64);
        self.core.after_mutation();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The wrapped queue.
    pub fn inner(&self) -> &Q {
        &self.inner
    }

    /// Probes shed on the lossy hot path (busy-wait exhaustion and resize
    /// races).
    pub fn dropped_probes(&self) -> u64 {
        self.core.dropped_probes.load(Ordering::Relaxed)
    }

    /// Flushes residual probes, closes the log, and releases the path.
    /// Idempotent and safe to race with writers and other closers.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

impl<T, Q: Fifo<T>, M: SyncMode> Drop for InstrumentedQueue<T, Q, M> {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl<T, Q: Fifo<T>, M: SyncMode> fmt::Debug for InstrumentedQueue<T, Q, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedQueue")
            .field("path", &self.core.config.path)
            .field("len", &self.inner.len())
            .field("state", &self.core.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, ManualClock, SpinConfig, WriteThreshold};
    use crate::format::Probe;
    use crate::log::scan_data_end;
    use std::path::Path;
    use tempfile::TempDir;

    const T0: i64 = 1_700_000_000_000;

    fn test_config(path: PathBuf) -> ProbeConfig {
        ProbeConfig {
            path,
            threshold: WriteThreshold {
                min_delay_millis: 0,
                min_size_delta: 0,
            },
            batch: BatchConfig {
                batch_capacity_probes: 1,
                flush_interval_millis: 10,
            },
            spin: SpinConfig::default(),
            ..ProbeConfig::default()
        }
        .normalized()
    }

    fn hooks_with_clock(clock: Arc<ManualClock>) -> ProbeHooks {
        ProbeHooks {
            clock,
            ..ProbeHooks::default()
        }
    }

    fn decode_cycle(base: &Path, format: WireFormat, cycle_start: i64) -> Vec<Probe> {
        let path = CycleFileName::new(cycle_start).resolve(base);
        let raw = std::fs::read(path).expect("read cycle file");
        let end = scan_data_end(&raw, format);
        let record = format.record_size();
        let mut probes = Vec::new();
        let mut cursor = format.header_size();
        while cursor + record <= end {
            let mut probe = Probe::default();
            format.decode(&raw[cursor..cursor + record], cycle_start, &mut probe);
            probes.push(probe);
            cursor += record;
        }
        probes
    }

    #[test]
    fn final_probe_matches_queue_size() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let config = test_config(tmp.path().join("sizes.qprobe"));
        let base = config.path.clone();
        let cycle = config.cycle_duration_millis as i64;
        let queue: InstrumentedQueue<u32, SegQueue<u32>, Concurrent> = InstrumentedQueue::new(
            SegQueue::new(),
            config,
            hooks_with_clock(clock.clone()),
            PathRegistry::new(),
            &scheduler,
        )
        .expect("queue");

        for i in 0..20u32 {
            clock.advance(1);
            assert!(queue.offer(i));
        }
        for _ in 0..7 {
            clock.advance(1);
            queue.poll().expect("item");
        }
        let final_len = queue.len();
        queue.close();
        assert!(queue.is_closed());

        let cycle_start = T0 - T0.rem_euclid(cycle);
        let probes = decode_cycle(&base, WireFormat::Compressed, cycle_start);
        assert_eq!(probes.last().expect("probes").count as usize, final_len);
        assert_eq!(probes.len(), 27);
    }

    #[test]
    fn threshold_suppresses_until_delta_reached() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let mut config = test_config(tmp.path().join("threshold.qprobe"));
        config.threshold = WriteThreshold {
            min_delay_millis: 5_000,
            min_size_delta: 2,
        };
        let base = config.path.clone();
        let cycle = config.cycle_duration_millis as i64;
        let queue: InstrumentedQueue<u32, SegQueue<u32>, Concurrent> = InstrumentedQueue::new(
            SegQueue::new(),
            config,
            hooks_with_clock(clock.clone()),
            PathRegistry::new(),
            &scheduler,
        )
        .expect("queue");

        // Two single enqueues: delta 1 each, time fresh -> suppressed.
        assert!(queue.offer(1));
        assert!(queue.offer(2));
        // Ten more at once: delta 10 -> one probe with the full count.
        assert_eq!(queue.offer_all(3..13), 10);
        queue.close();

        let cycle_start = T0 - T0.rem_euclid(cycle);
        let probes = decode_cycle(&base, WireFormat::Compressed, cycle_start);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].count, 12);
    }

    #[test]
    fn elapsed_time_alone_triggers_emission() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let mut config = test_config(tmp.path().join("elapsed.qprobe"));
        config.threshold = WriteThreshold {
            min_delay_millis: 5_000,
            min_size_delta: 100,
        };
        let base = config.path.clone();
        let cycle = config.cycle_duration_millis as i64;
        let queue: InstrumentedQueue<u32, SegQueue<u32>, Concurrent> = InstrumentedQueue::new(
            SegQueue::new(),
            config,
            hooks_with_clock(clock.clone()),
            PathRegistry::new(),
            &scheduler,
        )
        .expect("queue");

        assert!(queue.offer(1));
        clock.advance(5_000);
        assert!(queue.offer(2));
        queue.close();

        let cycle_start = T0 - T0.rem_euclid(cycle);
        let probes = decode_cycle(&base, WireFormat::Compressed, cycle_start);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].count, 2);
    }

    #[test]
    fn write_filter_vetoes_probes() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let config = test_config(tmp.path().join("filter.qprobe"));
        let base = config.path.clone();
        let cycle = config.cycle_duration_millis as i64;
        let hooks = ProbeHooks {
            write_filter: Some(Arc::new(|count, _ts| count % 2 == 0)),
            clock: clock.clone(),
            ..ProbeHooks::default()
        };
        let queue: InstrumentedQueue<u32, SegQueue<u32>, Concurrent> = InstrumentedQueue::new(
            SegQueue::new(),
            config,
            hooks,
            PathRegistry::new(),
            &scheduler,
        )
        .expect("queue");

        for i in 0..6u32 {
            clock.advance(1);
            queue.offer(i);
        }
        queue.close();

        let cycle_start = T0 - T0.rem_euclid(cycle);
        let probes = decode_cycle(&base, WireFormat::Compressed, cycle_start);
        assert_eq!(probes.iter().map(|p| p.count).collect::<Vec<_>>(), vec![2, 4, 6]);
    }

    #[test]
    fn duplicate_path_conflicts() {
        let tmp = TempDir::new().expect("tempdir");
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let registry = PathRegistry::new();
        let mut config = test_config(tmp.path().join("dup.qprobe"));
        config.registry_timeout_millis = 20;
        let first: InstrumentedQueue<u32, SegQueue<u32>, Concurrent> = InstrumentedQueue::new(
            SegQueue::new(),
            config.clone(),
            ProbeHooks::default(),
            registry.clone(),
            &scheduler,
        )
        .expect("first queue");

        let err = InstrumentedQueue::<u32, SegQueue<u32>, Concurrent>::new(
            SegQueue::new(),
            config.clone(),
            ProbeHooks::default(),
            registry.clone(),
            &scheduler,
        )
        .expect_err("duplicate path must conflict");
        assert!(matches!(err, ProbeError::PathConflict(_)));

        // After close the path is free again.
        first.close();
        let _second: InstrumentedQueue<u32, SegQueue<u32>, Concurrent> = InstrumentedQueue::new(
            SegQueue::new(),
            config,
            ProbeHooks::default(),
            registry,
            &scheduler,
        )
        .expect("register after close");
    }

    #[test]
    fn close_is_idempotent_under_concurrency() {
        let tmp = TempDir::new().expect("tempdir");
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let config = test_config(tmp.path().join("close.qprobe"));
        let queue: Arc<InstrumentedQueue<u32, SegQueue<u32>, Concurrent>> = Arc::new(
            InstrumentedQueue::new(
                SegQueue::new(),
                config,
                ProbeHooks::default(),
                PathRegistry::new(),
                &scheduler,
            )
            .expect("queue"),
        );
        queue.offer(1);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = queue.clone();
            handles.push(std::thread::spawn(move || q.close()));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        assert!(queue.is_closed());

        // Post-close writes are no-ops for telemetry but the wrapped queue
        // keeps working.
        assert!(queue.offer(2));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn closed_queue_emits_nothing_more() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let config = test_config(tmp.path().join("noop.qprobe"));
        let base = config.path.clone();
        let cycle = config.cycle_duration_millis as i64;
        let queue: InstrumentedQueue<u32, SegQueue<u32>, Concurrent> = InstrumentedQueue::new(
            SegQueue::new(),
            config,
            hooks_with_clock(clock.clone()),
            PathRegistry::new(),
            &scheduler,
        )
        .expect("queue");
        queue.offer(1);
        queue.close();
        queue.offer(2);
        queue.offer(3);

        let cycle_start = T0 - T0.rem_euclid(cycle);
        let probes = decode_cycle(&base, WireFormat::Compressed, cycle_start);
        assert_eq!(probes.len(), 1);
    }

    #[test]
    fn single_producer_mode_round_trip() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let config = test_config(tmp.path().join("single.qprobe"));
        let base = config.path.clone();
        let cycle = config.cycle_duration_millis as i64;
        let queue: InstrumentedQueue<u32, Mutex<VecDeque<u32>>, SingleProducer> =
            InstrumentedQueue::new(
                Mutex::new(VecDeque::new()),
                config,
                hooks_with_clock(clock.clone()),
                PathRegistry::new(),
                &scheduler,
            )
            .expect("queue");

        for i in 0..5u32 {
            clock.advance(1);
            queue.offer(i);
        }
        queue.clear();
        queue.close();

        let cycle_start = T0 - T0.rem_euclid(cycle);
        let probes = decode_cycle(&base, WireFormat::Compressed, cycle_start);
        assert_eq!(probes.last().expect("probes").count, 0);
        assert_eq!(probes.len(), 6);
    }

    #[test]
    fn bounded_queue_rejection_emits_no_probe() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let config = test_config(tmp.path().join("bounded.qprobe"));
        let base = config.path.clone();
        let cycle = config.cycle_duration_millis as i64;
        let queue: InstrumentedQueue<u32, ArrayQueue<u32>, Concurrent> = InstrumentedQueue::new(
            ArrayQueue::new(2),
            config,
            hooks_with_clock(clock.clone()),
            PathRegistry::new(),
            &scheduler,
        )
        .expect("queue");

        assert!(queue.offer(1));
        assert!(queue.offer(2));
        clock.advance(1);
        assert!(!queue.offer(3));
        queue.close();

        let cycle_start = T0 - T0.rem_euclid(cycle);
        let probes = decode_cycle(&base, WireFormat::Compressed, cycle_start);
        assert_eq!(probes.len(), 2);
        assert_eq!(probes.last().expect("probes").count, 2);
    }

    #[test]
    fn close_defers_to_live_busy_holder() {
        let tmp = TempDir::new().expect("tempdir");
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let config = test_config(tmp.path().join("defer.qprobe"));
        let queue: InstrumentedQueue<u32, SegQueue<u32>, Concurrent> = InstrumentedQueue::new(
            SegQueue::new(),
            config,
            ProbeHooks::default(),
            PathRegistry::new(),
            &scheduler,
        )
        .expect("queue");
        queue.offer(1);

        // Simulate an in-flight writer that owns the state.
        assert!(Concurrent::try_transition(
            &queue.core.state,
            QueueState::Free,
            QueueState::Busy
        ));
        let core = queue.core.clone();
        let closer = std::thread::spawn(move || core.close());

        // Close must wait for the holder rather than seize the state.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!queue.is_closed());
        assert_eq!(
            Concurrent::load_state(&queue.core.state),
            QueueState::Busy
        );

        // Releasing runs the pending close on the owning thread.
        queue.core.release_busy();
        closer.join().expect("join");
        assert!(queue.is_closed());
    }

    fn plant_corrupt_cycle_file(base: &Path, cycle_start: i64) {
        let path = CycleFileName::new(cycle_start).resolve(base);
        // A compressed header without the marker bit set.
        std::fs::write(path, 42_i64.to_le_bytes()).expect("write corrupt file");
    }

    #[test]
    fn error_handler_false_keeps_queue_open() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let mut config = test_config(tmp.path().join("handler.qprobe"));
        config.cycle_duration_millis = 60_000;
        let base = config.path.clone();
        let failures = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen = failures.clone();
        let hooks = ProbeHooks {
            error_handler: Some(Arc::new(move |_err| {
                seen.fetch_add(1, Ordering::SeqCst);
                false
            })),
            clock: clock.clone(),
            ..ProbeHooks::default()
        };
        let queue: InstrumentedQueue<u32, SegQueue<u32>, Concurrent> = InstrumentedQueue::new(
            SegQueue::new(),
            config,
            hooks,
            PathRegistry::new(),
            &scheduler,
        )
        .expect("queue");
        queue.offer(1);

        // The next cycle roll will hit a corrupt pre-existing file.
        let next_now = T0 + 61_000;
        let next_start = next_now - next_now.rem_euclid(60_000);
        plant_corrupt_cycle_file(&base, next_start);
        clock.advance(61_000);

        queue.offer(2);
        assert!(failures.load(Ordering::SeqCst) >= 1);
        assert!(!queue.is_closed());

        // The queue keeps operating after the handler elects to continue.
        queue.offer(3);
        assert_eq!(queue.len(), 3);
        assert!(!queue.is_closed());
    }

    #[test]
    fn error_handler_true_closes_queue() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let mut config = test_config(tmp.path().join("handler-close.qprobe"));
        config.cycle_duration_millis = 60_000;
        let base = config.path.clone();
        let hooks = ProbeHooks {
            error_handler: Some(Arc::new(|_err| true)),
            clock: clock.clone(),
            ..ProbeHooks::default()
        };
        let queue: InstrumentedQueue<u32, SegQueue<u32>, Concurrent> = InstrumentedQueue::new(
            SegQueue::new(),
            config,
            hooks,
            PathRegistry::new(),
            &scheduler,
        )
        .expect("queue");
        queue.offer(1);

        let next_now = T0 + 61_000;
        let next_start = next_now - next_now.rem_euclid(60_000);
        plant_corrupt_cycle_file(&base, next_start);
        clock.advance(61_000);

        queue.offer(2);
        assert!(queue.is_closed());
    }

    #[test]
    fn roll_opens_new_cycle_file() {
        let tmp = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(T0));
        let scheduler = FlushScheduler::new(SpinConfig::default());
        let mut config = test_config(tmp.path().join("roll.qprobe"));
        config.cycle_duration_millis = 60_000;
        let base = config.path.clone();
        let queue: InstrumentedQueue<u32, SegQueue<u32>, Concurrent> = InstrumentedQueue::new(
            SegQueue::new(),
            config,
            hooks_with_clock(clock.clone()),
            PathRegistry::new(),
            &scheduler,
        )
        .expect("queue");

        queue.offer(1);
        clock.advance(61_000);
        queue.offer(2);
        queue.close();

        let first_start = T0 - T0.rem_euclid(60_000);
        let second_now = T0 + 61_000;
        let second_start = second_now - second_now.rem_euclid(60_000);
        assert_ne!(first_start, second_start);

        let first = decode_cycle(&base, WireFormat::Compressed, first_start);
        let second = decode_cycle(&base, WireFormat::Compressed, second_start);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].count, 2);
    }
}
