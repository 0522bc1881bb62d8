//! Daemon role: drain the ring, recover stuck slots, prune dead natives
//!
//! State machine: `Bootstrapping → Serving → Draining → Stopped`.
//!
//! Threads while serving:
//! - drain: delivers slots strictly in write-index order
//! - watchdog: republishes slots abandoned in `Writing`
//! - guard: prunes native entries with stale heartbeats
//! - housekeeping: the caller of [`Daemon::serve`], decides when to stop

use crate::attachment::Attachment;
use crate::error::ShmResult;
use crate::layout::{Role, Slot, SlotState};
use crate::platform::monotonic_ms;
use crate::producer::backoff;
use crate::record::Record;
use crate::segment::SharedSegment;
use crate::sink::RecordSink;
use sirius::config::{LogLevel, TransportConfig};
use sirius::consts::DAEMON_ONLY_FLOOR;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Synthetic record published for a slot abandoned mid-write.
pub const RECOVERED_SLOT_TEXT: &str = "Slot recovered/skipped due to timeout\n";

const IDLE_SLEEP: Duration = Duration::from_micros(150);
/// Wait on one slot while draining for shutdown.
const STOPPING_SLOT_WAIT: Duration = Duration::from_millis(20);
/// Consecutive failed waits after which a stopping drain gives up.
const STOPPING_MAX_FAILURES: u32 = 5;
const WORKER_POLL_SLICE: Duration = Duration::from_millis(10);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Bootstrapping = 0,
    Serving = 1,
    Draining = 2,
    Stopped = 3,
}

impl DaemonState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Bootstrapping,
            1 => Self::Serving,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Totals returned by [`Daemon::serve`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonReport {
    pub delivered: u64,
    pub recovered: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    recovered: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    fn report(&self) -> DaemonReport {
        DaemonReport {
            delivered: self.delivered.load(Ordering::Acquire),
            recovered: self.recovered.load(Ordering::Acquire),
            skipped: self.skipped.load(Ordering::Acquire),
        }
    }
}

/// Observe or stop a daemon from another thread (e.g. a signal handler).
#[derive(Clone)]
pub struct DaemonHandle {
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
}

impl DaemonHandle {
    pub fn state(&self) -> DaemonState {
        DaemonState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Ask [`Daemon::serve`] to drain and stop.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// The single consumer of a segment.
pub struct Daemon {
    config: TransportConfig,
    segment: Arc<SharedSegment>,
    attachment: Option<Attachment>,
    handle: DaemonHandle,
    counters: Arc<Counters>,
    /// Drain: finish the ring, then exit.
    draining: Arc<AtomicBool>,
    /// Watchdog and guard: exit now.
    halt: Arc<AtomicBool>,
    drain: Option<JoinHandle<()>>,
    helpers: Vec<JoinHandle<()>>,
    started: Instant,
}

impl Daemon {
    /// Attach as the daemon, start the worker threads and mark the segment
    /// ready.
    pub fn bootstrap(config: TransportConfig, sink: Box<dyn RecordSink>) -> ShmResult<Self> {
        let handle = DaemonHandle {
            state: Arc::new(AtomicU8::new(DaemonState::Bootstrapping as u8)),
            stop: Arc::new(AtomicBool::new(false)),
        };
        let segment = Arc::new(SharedSegment::open_or_create(&config)?);
        let attachment = Attachment::register(Arc::clone(&segment), Role::Daemon, &config)?;

        let mut daemon = Self {
            config,
            segment,
            attachment: Some(attachment),
            handle,
            counters: Arc::new(Counters::default()),
            draining: Arc::new(AtomicBool::new(false)),
            halt: Arc::new(AtomicBool::new(false)),
            drain: None,
            helpers: Vec::new(),
            started: Instant::now(),
        };
        if let Err(e) = daemon.start_workers(sink) {
            daemon.stop_workers();
            daemon.set_state(DaemonState::Stopped);
            return Err(e);
        }

        daemon.segment.set_daemon_ready(true);
        daemon.set_state(DaemonState::Serving);
        info!(
            "Log daemon serving {} ({} slots)",
            daemon.segment.name(),
            daemon.segment.capacity()
        );
        Ok(daemon)
    }

    fn start_workers(&mut self, sink: Box<dyn RecordSink>) -> ShmResult<()> {
        let drain = DrainWorker {
            segment: Arc::clone(&self.segment),
            sink,
            counters: Arc::clone(&self.counters),
            stopping: Arc::clone(&self.draining),
            claim_timeout: self.config.claim_timeout(),
        };
        self.drain = Some(
            std::thread::Builder::new()
                .name("sirius-drain".to_string())
                .spawn(move || drain.run())?,
        );

        let watchdog = Watchdog {
            segment: Arc::clone(&self.segment),
            counters: Arc::clone(&self.counters),
            timeout_ms: self.config.slot_reset_timeout_ms,
        };
        let interval = self.config.watchdog_interval();
        let halt = Arc::clone(&self.halt);
        self.helpers.push(
            std::thread::Builder::new()
                .name("sirius-watchdog".to_string())
                .spawn(move || run_periodic(&halt, interval, || watchdog.scan()))?,
        );

        let segment = Arc::clone(&self.segment);
        let timeout_ms = self.config.process_guard_timeout_ms;
        let interval = self.config.heartbeat_interval();
        let halt = Arc::clone(&self.halt);
        self.helpers.push(
            std::thread::Builder::new()
                .name("sirius-guard".to_string())
                .spawn(move || run_periodic(&halt, interval, || prune_natives(&segment, timeout_ms)))?,
        );
        Ok(())
    }

    fn set_state(&self, state: DaemonState) {
        self.handle.state.store(state as u8, Ordering::Release);
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    pub fn report(&self) -> DaemonReport {
        self.counters.report()
    }

    /// Run housekeeping until the daemon is alone or a stop is requested,
    /// then drain and detach.
    pub fn serve(mut self) -> ShmResult<DaemonReport> {
        let mut seen_native = false;
        loop {
            std::thread::sleep(self.config.housekeeping_interval());
            if self.handle.stop.load(Ordering::Acquire) {
                info!("Stop requested");
                break;
            }
            let count = match self.segment.lock_metadata() {
                Ok(guard) => guard.table().count(),
                Err(e) => {
                    warn!("Housekeeping could not lock metadata: {}", e);
                    continue;
                }
            };
            if count > DAEMON_ONLY_FLOOR {
                seen_native = true;
            } else if seen_native || self.started.elapsed() >= self.config.idle_exit_grace() {
                info!("No native processes attached, stopping");
                break;
            }
        }
        Ok(self.shutdown())
    }

    fn shutdown(&mut self) -> DaemonReport {
        let guard = self.segment.lock_metadata();
        if let Err(e) = &guard {
            warn!("Stopping without the metadata lock: {}", e);
        }
        self.segment.invalidate();
        self.segment.set_daemon_ready(false);
        drop(guard);
        self.set_state(DaemonState::Draining);
        debug!("Draining {}", self.segment.name());

        self.stop_workers();
        if let Some(attachment) = self.attachment.take() {
            attachment.release();
        }
        self.set_state(DaemonState::Stopped);

        let report = self.counters.report();
        info!(
            "Log daemon stopped: {} delivered, {} recovered, {} skipped",
            report.delivered, report.recovered, report.skipped
        );
        report
    }

    fn stop_workers(&mut self) {
        // The watchdog keeps running while the drain finishes.
        self.draining.store(true, Ordering::Release);
        if let Some(drain) = self.drain.take() {
            if drain.join().is_err() {
                error!("Drain thread panicked");
            }
        }
        self.halt.store(true, Ordering::Release);
        for helper in self.helpers.drain(..) {
            if helper.join().is_err() {
                error!("Daemon worker thread panicked");
            }
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if self.handle.state() != DaemonState::Stopped {
            self.shutdown();
        }
    }
}

fn run_periodic(halt: &AtomicBool, interval: Duration, mut task: impl FnMut()) {
    loop {
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if halt.load(Ordering::Acquire) {
                return;
            }
            std::thread::sleep(WORKER_POLL_SLICE.min(interval));
        }
        task();
    }
}

fn prune_natives(segment: &SharedSegment, timeout_ms: u64) {
    let guard = match segment.lock_metadata() {
        Ok(guard) => guard,
        Err(e) => {
            warn!("Guard could not lock metadata: {}", e);
            return;
        }
    };
    for (index, pid) in guard.table().prune(monotonic_ms(), timeout_ms) {
        warn!("Pruned stale attachment {} of pid {}", index, pid);
    }
}

/// Slot back to Free for the next lap.
fn release_slot(segment: &SharedSegment, slot: &Slot, index: u64) {
    slot.len.store(0, Ordering::Relaxed);
    slot.timestamp_ms.store(monotonic_ms(), Ordering::Release);
    slot.turn
        .store(index + segment.capacity() as u64, Ordering::Release);
    slot.publish(SlotState::Free);
}

enum SlotOutcome {
    Delivered,
    Skipped,
    GaveUp,
}

struct DrainWorker {
    segment: Arc<SharedSegment>,
    sink: Box<dyn RecordSink>,
    counters: Arc<Counters>,
    stopping: Arc<AtomicBool>,
    claim_timeout: Duration,
}

impl DrainWorker {
    fn run(mut self) {
        let mut failures = 0u32;
        loop {
            let stopping = self.stopping.load(Ordering::Acquire);
            let index = self.segment.read_index();
            if index >= self.segment.write_index() {
                if stopping {
                    break;
                }
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }

            match self.consume(index, stopping) {
                SlotOutcome::Delivered | SlotOutcome::Skipped => {
                    self.segment.advance_read_index();
                    failures = 0;
                }
                SlotOutcome::GaveUp => {
                    failures += 1;
                    if failures >= STOPPING_MAX_FAILURES {
                        warn!(
                            "Giving up drain at index {} of {}",
                            index,
                            self.segment.write_index()
                        );
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.sink.flush() {
            warn!("Sink flush failed: {}", e);
        }
    }

    fn consume(&mut self, index: u64, stopping: bool) -> SlotOutcome {
        let started = Instant::now();
        let free_wait = if stopping {
            self.claim_timeout.min(STOPPING_SLOT_WAIT)
        } else {
            self.claim_timeout
        };
        // Owned handle: `deliver` needs `&mut self` while the slot is borrowed.
        let segment = Arc::clone(&self.segment);
        let mut attempt = 0u32;
        loop {
            let slot = segment.slot(index);
            match slot.state() {
                Some(SlotState::Ready) => return self.deliver(slot, index),
                Some(SlotState::Free) if started.elapsed() >= free_wait => {
                    // Claim it ourselves so a late producer cannot publish.
                    if slot.transition(SlotState::Free, SlotState::Recovering) {
                        warn!("Skip corrupted slot index {}", index);
                        release_slot(&self.segment, slot, index);
                        self.counters.skipped.fetch_add(1, Ordering::AcqRel);
                        return SlotOutcome::Skipped;
                    }
                }
                Some(SlotState::Writing | SlotState::Recovering)
                    if stopping && started.elapsed() >= STOPPING_SLOT_WAIT =>
                {
                    return SlotOutcome::GaveUp;
                }
                None => {
                    warn!("Slot index {} holds an invalid state, skipping", index);
                    release_slot(&self.segment, slot, index);
                    self.counters.skipped.fetch_add(1, Ordering::AcqRel);
                    return SlotOutcome::Skipped;
                }
                _ => {}
            }
            backoff(attempt);
            attempt = attempt.saturating_add(1);
        }
    }

    fn deliver(&mut self, slot: &Slot, index: u64) -> SlotOutcome {
        let sequence = slot.sequence.load(Ordering::Acquire);
        if sequence != index {
            warn!(
                "Slot index {} holds sequence {}, skipping",
                index, sequence
            );
            release_slot(&self.segment, slot, index);
            self.counters.skipped.fetch_add(1, Ordering::AcqRel);
            return SlotOutcome::Skipped;
        }
        // SAFETY: Ready, and the drain thread is the only consumer.
        let payload = unsafe { slot.read_payload() };
        release_slot(&self.segment, slot, index);

        match Record::decode(&payload) {
            Ok(record) => {
                if let Err(e) = self.sink.deliver(index, &record) {
                    warn!("Sink rejected record {}: {}", index, e);
                }
                self.counters.delivered.fetch_add(1, Ordering::AcqRel);
                SlotOutcome::Delivered
            }
            Err(e) => {
                warn!("Dropping record {}: {}", index, e);
                self.counters.skipped.fetch_add(1, Ordering::AcqRel);
                SlotOutcome::Skipped
            }
        }
    }
}

struct Watchdog {
    segment: Arc<SharedSegment>,
    counters: Arc<Counters>,
    timeout_ms: u64,
}

impl Watchdog {
    fn scan(&self) {
        let now = monotonic_ms();
        for pos in 0..self.segment.capacity() as u64 {
            let slot = self.segment.slot(pos);
            if slot.state() != Some(SlotState::Writing) {
                continue;
            }
            let age = now.saturating_sub(slot.timestamp_ms.load(Ordering::Acquire));
            if age > self.timeout_ms && slot.transition(SlotState::Writing, SlotState::Recovering) {
                self.recover(slot, age);
            }
        }
    }

    fn recover(&self, slot: &Slot, age_ms: u64) {
        let index = slot.turn.load(Ordering::Acquire);
        let synthetic = Record::log(LogLevel::Error, RECOVERED_SLOT_TEXT);
        let payload = synthetic.encode().unwrap_or_default();
        slot.sequence.store(index, Ordering::Release);
        // SAFETY: the watchdog owns the slot while it is Recovering.
        unsafe { slot.write_payload(&payload) };
        slot.timestamp_ms.store(monotonic_ms(), Ordering::Release);
        slot.publish(SlotState::Ready);
        self.counters.recovered.fetch_add(1, Ordering::AcqRel);
        error!(
            "Slot for index {} recovered after {} ms in Writing",
            index, age_ms
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    struct VecSink(Arc<Mutex<Vec<(u64, Record)>>>);

    impl RecordSink for VecSink {
        fn deliver(&mut self, sequence: u64, record: &Record) -> std::io::Result<()> {
            self.0.lock().push((sequence, record.clone()));
            Ok(())
        }
    }

    fn segment(tag: &str) -> (TempDir, Arc<SharedSegment>) {
        let dir = tempfile::tempdir().unwrap();
        let key = format!(
            "cons_{}_{}_{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let config = TransportConfig::with_key(key)
            .lock_dir(dir.path())
            .capacity(4);
        (dir, Arc::new(SharedSegment::open_or_create(&config).unwrap()))
    }

    fn drain_worker(segment: &Arc<SharedSegment>) -> (DrainWorker, Arc<Mutex<Vec<(u64, Record)>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let worker = DrainWorker {
            segment: Arc::clone(segment),
            sink: Box::new(VecSink(Arc::clone(&records))),
            counters: Arc::new(Counters::default()),
            stopping: Arc::new(AtomicBool::new(true)),
            claim_timeout: Duration::from_millis(10),
        };
        (worker, records)
    }

    fn publish(segment: &SharedSegment, record: &Record) -> u64 {
        let index = segment.claim_index();
        let slot = segment.slot(index);
        assert!(slot.transition(SlotState::Free, SlotState::Writing));
        slot.sequence.store(index, Ordering::Release);
        unsafe { slot.write_payload(&record.encode().unwrap()) };
        slot.publish(SlotState::Ready);
        index
    }

    #[test]
    fn test_state_codes() {
        for state in [
            DaemonState::Bootstrapping,
            DaemonState::Serving,
            DaemonState::Draining,
            DaemonState::Stopped,
        ] {
            assert_eq!(DaemonState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_drain_delivers_in_order_and_frees_slots() {
        let (_dir, segment) = segment("order");
        for i in 0..3 {
            publish(&segment, &Record::log(LogLevel::Info, format!("{i}")));
        }
        let (worker, records) = drain_worker(&segment);
        let counters = Arc::clone(&worker.counters);
        worker.run();

        let records = records.lock();
        let sequences: Vec<u64> = records.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(counters.report().delivered, 3);
        assert_eq!(segment.read_index(), 3);
        for i in 0..3u64 {
            let slot = segment.slot(i);
            assert_eq!(slot.state(), Some(SlotState::Free));
            assert_eq!(slot.turn.load(Ordering::Acquire), i + 4);
        }
    }

    #[test]
    fn test_drain_skips_unclaimed_index() {
        let (_dir, segment) = segment("skip");
        // Claimed but never written, e.g. by a producer that fell back.
        segment.claim_index();
        publish(&segment, &Record::log(LogLevel::Info, "after\n"));

        let (worker, records) = drain_worker(&segment);
        let counters = Arc::clone(&worker.counters);
        worker.run();

        assert_eq!(counters.report().skipped, 1);
        assert_eq!(records.lock().len(), 1);
        assert_eq!(records.lock()[0].0, 1);
        assert_eq!(segment.slot(0).turn.load(Ordering::Acquire), 4);
    }

    #[test]
    fn test_watchdog_recovers_stale_writing_slot() {
        let (_dir, segment) = segment("watchdog");
        let index = segment.claim_index();
        let slot = segment.slot(index);
        assert!(slot.transition(SlotState::Free, SlotState::Writing));
        slot.timestamp_ms.store(1, Ordering::Release);

        let counters = Arc::new(Counters::default());
        let watchdog = Watchdog {
            segment: Arc::clone(&segment),
            counters: Arc::clone(&counters),
            timeout_ms: 10,
        };
        watchdog.scan();

        assert_eq!(slot.state(), Some(SlotState::Ready));
        assert_eq!(slot.sequence.load(Ordering::Acquire), index);
        assert_eq!(counters.report().recovered, 1);
        let payload = unsafe { slot.read_payload() };
        assert_eq!(
            Record::decode(&payload).unwrap(),
            Record::log(LogLevel::Error, RECOVERED_SLOT_TEXT)
        );
    }

    #[test]
    fn test_watchdog_leaves_fresh_writing_slot() {
        let (_dir, segment) = segment("fresh");
        let slot = segment.slot(segment.claim_index());
        assert!(slot.transition(SlotState::Free, SlotState::Writing));
        slot.timestamp_ms.store(monotonic_ms(), Ordering::Release);

        let watchdog = Watchdog {
            segment: Arc::clone(&segment),
            counters: Arc::new(Counters::default()),
            timeout_ms: 60_000,
        };
        watchdog.scan();
        assert_eq!(slot.state(), Some(SlotState::Writing));
    }
}
