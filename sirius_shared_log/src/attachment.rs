//! Attachment table and per-process heartbeat
//!
//! Every attached process owns one table entry whose timestamp a background
//! thread refreshes. The daemon prunes natives whose heartbeat went stale;
//! natives watch for the daemon disappearing.

use crate::error::{ShmError, ShmResult};
use crate::layout::{Header, Role};
use crate::platform::{get_current_pid, is_process_alive, monotonic_ms};
use crate::segment::{MetadataGuard, SharedSegment};
use sirius::config::TransportConfig;
use sirius::consts::PROCESS_MAX;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest wait for a heartbeat thread to confirm its entry.
const REGISTER_CONFIRM_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound of one heartbeat sleep slice.
const STOP_POLL_SLICE: Duration = Duration::from_millis(20);

/// View of the attachment table, only available under [`MetadataGuard`].
pub struct AttachmentTable<'g> {
    header: &'g Header,
}

impl MetadataGuard<'_> {
    /// The attachment table guarded by this lock.
    pub fn table(&self) -> AttachmentTable<'_> {
        AttachmentTable {
            header: self.header(),
        }
    }
}

impl AttachmentTable<'_> {
    /// Take the first free entry for `pid`.
    pub fn alloc(&self, role: Role, pid: u32, now_ms: u64) -> ShmResult<usize> {
        let (index, entry) = self
            .header
            .entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.role() == Role::None)
            .ok_or(ShmError::TableFull { max: PROCESS_MAX })?;
        entry.pid.store(pid, Ordering::Release);
        entry.last_heartbeat_ms.store(now_ms, Ordering::Release);
        entry.role.store(role as u32, Ordering::Release);
        self.header.attached_count.fetch_add(1, Ordering::AcqRel);
        Ok(index)
    }

    fn owns(&self, index: usize, pid: u32) -> bool {
        self.header
            .entries
            .get(index)
            .is_some_and(|e| e.role() != Role::None && e.pid() == pid)
    }

    fn release_entry(&self, index: usize) {
        self.header.entries[index].clear();
        let _ = self
            .header
            .attached_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    /// Free `index` if `pid` still owns it.
    pub fn free(&self, index: usize, pid: u32) -> bool {
        if !self.owns(index, pid) {
            return false;
        }
        self.release_entry(index);
        true
    }

    /// Refresh the timestamp of an owned entry.
    pub fn heartbeat(&self, index: usize, pid: u32, now_ms: u64) -> bool {
        if !self.owns(index, pid) {
            return false;
        }
        self.header.entries[index]
            .last_heartbeat_ms
            .store(now_ms, Ordering::Release);
        true
    }

    /// Remove natives with a stale heartbeat or a dead pid.
    pub fn prune(&self, now_ms: u64, timeout_ms: u64) -> Vec<(usize, u32)> {
        self.remove_where(Role::Native, now_ms, timeout_ms)
    }

    /// Remove daemon entries with a stale heartbeat or a dead pid.
    pub fn reclaim_dead_daemons(&self, now_ms: u64, timeout_ms: u64) -> Vec<(usize, u32)> {
        self.remove_where(Role::Daemon, now_ms, timeout_ms)
    }

    fn remove_where(&self, role: Role, now_ms: u64, timeout_ms: u64) -> Vec<(usize, u32)> {
        let mut removed = Vec::new();
        for (index, entry) in self.header.entries.iter().enumerate() {
            if entry.role() != role {
                continue;
            }
            let stale = now_ms.saturating_sub(entry.last_heartbeat_ms()) > timeout_ms;
            if stale || !is_process_alive(entry.pid()) {
                removed.push((index, entry.pid()));
                self.release_entry(index);
            }
        }
        removed
    }

    /// Pid of a daemon entry with a fresh heartbeat and a live process.
    pub fn live_daemon(&self, now_ms: u64, timeout_ms: u64) -> Option<u32> {
        self.header
            .entries
            .iter()
            .find(|e| {
                e.role() == Role::Daemon
                    && now_ms.saturating_sub(e.last_heartbeat_ms()) <= timeout_ms
                    && is_process_alive(e.pid())
            })
            .map(|e| e.pid())
    }

    /// Live entries according to the header counter.
    pub fn count(&self) -> u32 {
        self.header.attached_count.load(Ordering::Acquire)
    }

    /// Entries currently holding a role.
    pub fn occupied(&self) -> usize {
        self.header
            .entries
            .iter()
            .filter(|e| e.role() != Role::None)
            .count()
    }
}

/// A registered attachment with its running heartbeat thread.
pub struct Attachment {
    segment: Arc<SharedSegment>,
    role: Role,
    index: usize,
    pid: u32,
    stop: Arc<AtomicBool>,
    seen_daemon: Arc<AtomicBool>,
    daemon_lost: Arc<AtomicBool>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Attachment {
    /// Allocate an entry for this process and start its heartbeat.
    ///
    /// A daemon registration first reclaims dead daemon entries and fails
    /// with `DaemonAlreadyRunning` if a live daemon remains.
    pub fn register(
        segment: Arc<SharedSegment>,
        role: Role,
        config: &TransportConfig,
    ) -> ShmResult<Self> {
        let pid = get_current_pid();
        let index = {
            let guard = segment.lock_metadata()?;
            let table = guard.table();
            let now = monotonic_ms();
            if role == Role::Daemon {
                claim_daemon_role(&guard, now, config.process_guard_timeout_ms)?;
            }
            let index = table.alloc(role, pid, now)?;
            debug!("Allocated attachment {} for pid {} as {:?}", index, pid, role);
            index
        };

        let stop = Arc::new(AtomicBool::new(false));
        let seen_daemon = Arc::new(AtomicBool::new(false));
        let daemon_lost = Arc::new(AtomicBool::new(false));
        let (confirm_tx, confirm_rx) = mpsc::sync_channel(1);
        let worker = HeartbeatWorker {
            segment: Arc::clone(&segment),
            role,
            index,
            pid,
            interval: config.heartbeat_interval(),
            guard_timeout_ms: config.process_guard_timeout_ms,
            stop: Arc::clone(&stop),
            seen_daemon: Arc::clone(&seen_daemon),
            daemon_lost: Arc::clone(&daemon_lost),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("sirius-heartbeat-{index}"))
            .spawn(move || worker.run(confirm_tx));

        let mut attachment = Self {
            segment,
            role,
            index,
            pid,
            stop,
            seen_daemon,
            daemon_lost,
            heartbeat: None,
        };
        match spawned {
            Ok(handle) => attachment.heartbeat = Some(handle),
            Err(e) => {
                attachment.free_entry();
                return Err(e.into());
            }
        }

        match confirm_rx.recv_timeout(REGISTER_CONFIRM_TIMEOUT) {
            Ok(true) => Ok(attachment),
            _ => {
                attachment.shutdown();
                Err(ShmError::Lock {
                    name: attachment.segment.name().to_string(),
                    reason: "heartbeat did not confirm its attachment".to_string(),
                })
            }
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    /// Raised by a native heartbeat once a previously seen daemon is gone.
    pub fn daemon_lost(&self) -> bool {
        self.daemon_lost.load(Ordering::Acquire)
    }

    /// A live daemon was confirmed; its disappearance now counts as lost.
    pub(crate) fn mark_daemon_seen(&self) {
        self.seen_daemon.store(true, Ordering::Release);
    }

    pub(crate) fn daemon_lost_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.daemon_lost)
    }

    /// Stop the heartbeat and free the entry.
    pub fn release(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.heartbeat.take() {
            if handle.join().is_err() {
                warn!("Heartbeat thread of attachment {} panicked", self.index);
            }
            self.free_entry();
        }
    }

    fn free_entry(&self) {
        match self.segment.lock_metadata() {
            Ok(guard) => {
                if guard.table().free(self.index, self.pid) {
                    debug!("Freed attachment {} of pid {}", self.index, self.pid);
                }
            }
            Err(e) => warn!("Failed to free attachment {}: {}", self.index, e),
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn claim_daemon_role(guard: &MetadataGuard<'_>, now: u64, timeout_ms: u64) -> ShmResult<()> {
    let table = guard.table();
    for (index, pid) in table.reclaim_dead_daemons(now, timeout_ms) {
        warn!("Reclaimed entry {} of dead daemon pid {}", index, pid);
    }
    if let Some(pid) = table.live_daemon(now, timeout_ms) {
        return Err(ShmError::DaemonAlreadyRunning { pid });
    }
    let segment = guard.segment();
    if segment.daemon_ready() {
        // Left behind by a daemon that was killed or died mid-shutdown.
        warn!("Clearing stale ready flag on {}", segment.name());
        segment.set_daemon_ready(false);
    }
    Ok(())
}

struct HeartbeatWorker {
    segment: Arc<SharedSegment>,
    role: Role,
    index: usize,
    pid: u32,
    interval: Duration,
    guard_timeout_ms: u64,
    stop: Arc<AtomicBool>,
    seen_daemon: Arc<AtomicBool>,
    daemon_lost: Arc<AtomicBool>,
}

impl HeartbeatWorker {
    fn run(self, confirm: mpsc::SyncSender<bool>) {
        let confirmed = self.beat().unwrap_or(false);
        let _ = confirm.send(confirmed);
        if !confirmed {
            return;
        }

        while self.sleep_interval() {
            match self.beat() {
                Some(true) => {}
                Some(false) => {
                    warn!(
                        "Attachment {} of pid {} was pruned, heartbeat stops",
                        self.index, self.pid
                    );
                    self.daemon_lost.store(true, Ordering::Release);
                    return;
                }
                None => continue,
            }
            if self.role == Role::Native {
                self.watch_daemon();
            }
        }
    }

    /// `Some(owned)` after a successful lock, `None` when locking failed.
    fn beat(&self) -> Option<bool> {
        match self.segment.lock_metadata() {
            Ok(guard) => Some(guard.table().heartbeat(self.index, self.pid, monotonic_ms())),
            Err(e) => {
                warn!("Heartbeat of attachment {} failed: {}", self.index, e);
                None
            }
        }
    }

    fn watch_daemon(&self) {
        let live = match self.segment.lock_metadata() {
            Ok(guard) => guard
                .table()
                .live_daemon(monotonic_ms(), self.guard_timeout_ms),
            Err(_) => return,
        };
        match live {
            Some(_) => self.seen_daemon.store(true, Ordering::Release),
            None if self.seen_daemon.load(Ordering::Acquire)
                && !self.daemon_lost.swap(true, Ordering::AcqRel) =>
            {
                info!("Log daemon vanished, switching to direct output");
            }
            None => {}
        }
    }

    /// Sleep one interval in short slices; false once stop is requested.
    fn sleep_interval(&self) -> bool {
        let deadline = Instant::now() + self.interval;
        loop {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(STOP_POLL_SLICE.min(deadline - now));
        }
    }
}
