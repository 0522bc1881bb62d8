//! Binary layout of the shared segment
//!
//! ```text
//! ┌──────────────────────────────┐ offset 0
//! │ Header                       │ magic, layout hash, capacity, flags,
//! │                              │ robust mutex, attachment table,
//! │                              │ write index (own line), read index (own line)
//! ├──────────────────────────────┤ size_of::<Header>()
//! │ Slot 0 (4096 B)              │
//! │ Slot 1                       │
//! │ ...                          │
//! │ Slot capacity-1              │
//! └──────────────────────────────┘ segment_size(capacity)
//! ```
//!
//! All header and slot fields that more than one process touches are
//! atomics; the slot payload is only accessed by the current owner of the
//! slot as defined by [`SlotState`].

#[cfg(target_os = "linux")]
use crate::platform::linux::RobustMutex;
use serde::Serialize;
use sirius::consts::{CACHE_LINE_SIZE, PROCESS_MAX};
use static_assertions::const_assert_eq;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Header stamp, "SIRIUSLG".
pub const SEGMENT_MAGIC: u64 = 0x5349_5249_5553_4C47;

/// Size of one ring slot in bytes.
pub const SLOT_SIZE: usize = 4096;

/// Bytes of slot metadata preceding the payload.
pub const SLOT_META_SIZE: usize = 32;

/// Maximum encoded record length.
pub const SLOT_PAYLOAD_SIZE: usize = SLOT_SIZE - SLOT_META_SIZE;

/// Slot state machine: `Free → Writing → Ready → Free`.
///
/// `Recovering` is held only by the watchdog while it replaces the content
/// of an abandoned `Writing` slot.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free = 0,
    Writing = 1,
    Ready = 2,
    Recovering = 3,
}

impl SlotState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Free),
            1 => Some(Self::Writing),
            2 => Some(Self::Ready),
            3 => Some(Self::Recovering),
            _ => None,
        }
    }
}

/// Role of an attachment table entry.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    None = 0,
    Daemon = 1,
    Native = 2,
}

impl Role {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Daemon,
            2 => Self::Native,
            _ => Self::None,
        }
    }
}

/// One attachment table entry.
#[repr(C)]
pub struct AttachmentEntry {
    pub role: AtomicU32,
    pub pid: AtomicU32,
    pub last_heartbeat_ms: AtomicU64,
}

impl AttachmentEntry {
    pub fn role(&self) -> Role {
        Role::from_u32(self.role.load(Ordering::Acquire))
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.role.store(Role::None as u32, Ordering::Release);
        self.pid.store(0, Ordering::Release);
        self.last_heartbeat_ms.store(0, Ordering::Release);
    }
}

/// A 64-bit counter alone on its cache line.
#[repr(C, align(64))]
pub struct PaddedIndex {
    pub value: AtomicU64,
}

/// Segment header, followed in memory by `capacity` slots.
#[repr(C, align(64))]
pub struct Header {
    /// Written last by the creator; cleared by a stopping daemon.
    pub magic: AtomicU64,
    pub layout_hash: AtomicU64,
    pub capacity: AtomicU64,
    pub item_size: AtomicU64,
    pub daemon_ready: AtomicU32,
    pub attached_count: AtomicU32,
    /// Segment-scoped ShmMutex.
    #[cfg(target_os = "linux")]
    pub mutex: RobustMutex,
    pub entries: [AttachmentEntry; PROCESS_MAX],
    pub write_index: PaddedIndex,
    pub read_index: PaddedIndex,
}

/// One ring slot.
#[repr(C, align(64))]
pub struct Slot {
    pub state: AtomicU32,
    /// Encoded record length.
    pub len: AtomicU32,
    /// Only write index allowed to claim this slot next.
    pub turn: AtomicU64,
    /// Write index of the current content.
    pub sequence: AtomicU64,
    /// Time of the last state transition, monotonic ms.
    pub timestamp_ms: AtomicU64,
    payload: UnsafeCell<[u8; SLOT_PAYLOAD_SIZE]>,
}

// SAFETY: the payload is written only by the process that moved the slot
// into Writing/Recovering and read only by the consumer after Ready.
unsafe impl Sync for Slot {}

const_assert_eq!(core::mem::size_of::<Slot>(), SLOT_SIZE);
const_assert_eq!(core::mem::align_of::<Slot>(), CACHE_LINE_SIZE);
const_assert_eq!(core::mem::size_of::<PaddedIndex>(), CACHE_LINE_SIZE);
const_assert_eq!(core::mem::size_of::<Header>() % CACHE_LINE_SIZE, 0);
const_assert_eq!(core::mem::size_of::<AttachmentEntry>(), 16);

impl Slot {
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Move the slot from `from` to `to` if it is still in `from`.
    pub fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn publish(&self, state: SlotState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Copy `bytes` into the payload and record its length.
    ///
    /// # Safety
    ///
    /// The caller must own the slot, i.e. have moved it into `Writing` or
    /// `Recovering`. `bytes` must fit into [`SLOT_PAYLOAD_SIZE`].
    pub unsafe fn write_payload(&self, bytes: &[u8]) {
        let len = bytes.len().min(SLOT_PAYLOAD_SIZE);
        // SAFETY: exclusive access is guaranteed by the caller.
        unsafe {
            let dst = self.payload.get() as *mut u8;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, len);
        }
        self.len.store(len as u32, Ordering::Release);
    }

    /// Copy the payload out.
    ///
    /// # Safety
    ///
    /// The caller must have observed the slot in `Ready` and be its consumer.
    pub unsafe fn read_payload(&self) -> Vec<u8> {
        let len = (self.len.load(Ordering::Acquire) as usize).min(SLOT_PAYLOAD_SIZE);
        let mut out = vec![0u8; len];
        // SAFETY: no writer touches a Ready slot.
        unsafe {
            let src = self.payload.get() as *const u8;
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len);
        }
        out
    }
}

const fn type_hash<T>() -> u64 {
    let size = core::mem::size_of::<T>() as u64;
    let align = core::mem::align_of::<T>() as u64;
    size.wrapping_mul(0x9E37_79B9) ^ align.wrapping_mul(0x517C_C1B7)
}

/// Hash of the header and slot layout; attachers refuse a mismatch.
pub const fn layout_hash() -> u64 {
    type_hash::<Header>().rotate_left(32) ^ type_hash::<Slot>() ^ (PROCESS_MAX as u64)
}

/// Bytes taken by the header.
pub const fn header_size() -> usize {
    core::mem::size_of::<Header>()
}

/// Total segment size for `capacity` slots.
pub const fn segment_size(capacity: usize) -> usize {
    header_size() + capacity * SLOT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_and_header_alignment() {
        assert_eq!(core::mem::size_of::<Slot>(), 4096);
        assert_eq!(core::mem::align_of::<Header>(), 64);
        assert_eq!(header_size() % 64, 0);
        assert_eq!(segment_size(2), header_size() + 8192);
    }

    #[test]
    fn test_indices_on_separate_cache_lines() {
        let write = core::mem::offset_of!(Header, write_index);
        let read = core::mem::offset_of!(Header, read_index);
        assert_eq!(write % 64, 0);
        assert_eq!(read - write, 64);
    }

    #[test]
    fn test_payload_starts_after_metadata() {
        assert_eq!(core::mem::offset_of!(Slot, payload), SLOT_META_SIZE);
    }

    #[test]
    fn test_layout_hash_is_stable() {
        assert_eq!(layout_hash(), layout_hash());
        assert_ne!(layout_hash(), 0);
    }

    #[test]
    fn test_state_codes() {
        for state in [
            SlotState::Free,
            SlotState::Writing,
            SlotState::Ready,
            SlotState::Recovering,
        ] {
            assert_eq!(SlotState::from_u32(state as u32), Some(state));
        }
        assert_eq!(SlotState::from_u32(9), None);
        assert_eq!(Role::from_u32(2), Role::Native);
        assert_eq!(Role::from_u32(7), Role::None);
    }
}
