//! Native role: publish records into the ring
//!
//! Slots are claimed by a single `fetch_add` on the write index, which gives
//! every record a global sequence number. A producer may only fill a slot
//! whose `turn` equals its index, so ring wraparound never reorders records.

use crate::attachment::Attachment;
use crate::bootstrap;
use crate::error::ShmResult;
use crate::layout::{Slot, SlotState};
use crate::platform::monotonic_ms;
use crate::record::Record;
use crate::segment::SharedSegment;
use sirius::config::TransportConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 1_000;
const BACKOFF_SLEEP: Duration = Duration::from_nanos(500);

/// Outcome of [`NativeTransport::produce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Published; the daemon delivers it as number `sequence`.
    Queued { sequence: u64 },
    /// Not published; the caller writes the record directly.
    Fallback,
}

/// Spin, then yield, then sleep briefly.
pub(crate) fn backoff(attempt: u32) {
    if attempt < SPIN_LIMIT {
        std::hint::spin_loop();
    } else if attempt < YIELD_LIMIT {
        std::thread::yield_now();
    } else {
        std::thread::sleep(BACKOFF_SLEEP);
    }
}

/// A native attachment to a running daemon's segment.
pub struct NativeTransport {
    // Declared first so the entry is freed before the segment detaches.
    attachment: Attachment,
    segment: Arc<SharedSegment>,
    daemon_lost: Arc<AtomicBool>,
}

impl NativeTransport {
    /// Attach as a native, spawning the daemon if needed, and wait for it.
    pub fn connect(config: &TransportConfig) -> ShmResult<Self> {
        let (segment, attachment) = bootstrap::attach_native(config)?;
        info!(
            "Connected to log daemon on {} as attachment {}",
            segment.name(),
            attachment.index()
        );
        Ok(Self::from_parts(segment, attachment))
    }

    pub(crate) fn from_parts(segment: Arc<SharedSegment>, attachment: Attachment) -> Self {
        let daemon_lost = attachment.daemon_lost_flag();
        Self {
            attachment,
            segment,
            daemon_lost,
        }
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    /// Daemon ready and not lost.
    pub fn is_available(&self) -> bool {
        self.segment.daemon_ready() && !self.daemon_lost.load(Ordering::Acquire)
    }

    /// Publish `record`; never fails, at worst asks for a direct write.
    pub fn produce(&self, record: &Record) -> Delivery {
        if !self.is_available() {
            return Delivery::Fallback;
        }
        let payload = match record.encode() {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Record not queued: {}", e);
                return Delivery::Fallback;
            }
        };

        let index = self.segment.claim_index();
        let slot = self.segment.slot(index);
        if !self.acquire(slot, index) {
            return Delivery::Fallback;
        }

        slot.sequence.store(index, Ordering::Release);
        // SAFETY: this producer moved the slot into Writing for `index`.
        unsafe { slot.write_payload(&payload) };
        slot.timestamp_ms.store(monotonic_ms(), Ordering::Release);
        if slot.transition(SlotState::Writing, SlotState::Ready) {
            Delivery::Queued { sequence: index }
        } else {
            // The watchdog reclaimed the slot while we were writing.
            debug!("Slot for index {} was reclaimed during write", index);
            Delivery::Fallback
        }
    }

    /// Wait for our turn on `slot` and move it into Writing.
    fn acquire(&self, slot: &Slot, index: u64) -> bool {
        let mut attempt = 0u32;
        loop {
            let turn = slot.turn.load(Ordering::Acquire);
            if turn > index || !self.is_available() {
                // Skipped by the consumer, or nobody left to consume.
                return false;
            }
            if turn == index && slot.state() == Some(SlotState::Free) {
                slot.timestamp_ms.store(monotonic_ms(), Ordering::Release);
                if slot.transition(SlotState::Free, SlotState::Writing) {
                    if slot.turn.load(Ordering::Acquire) == index {
                        return true;
                    }
                    // Skipped between the turn check and the claim.
                    slot.publish(SlotState::Free);
                    return false;
                }
            }
            backoff(attempt);
            attempt = attempt.saturating_add(1);
        }
    }

    /// Stop the heartbeat, free the entry and detach.
    pub fn disconnect(self) {
        let Self {
            attachment,
            segment,
            ..
        } = self;
        attachment.release();
        // Still referenced elsewhere: detaches on last drop instead.
        if let Ok(segment) = Arc::try_unwrap(segment) {
            if let Err(e) = segment.detach() {
                warn!("Detach failed: {}", e);
            }
        }
    }
}
