//! Shared memory segment: creation election, validation and detach

use crate::error::{ShmError, ShmResult};
use crate::layout::{
    Header, Role, SEGMENT_MAGIC, SLOT_SIZE, Slot, SlotState, header_size, layout_hash,
    segment_size,
};
use crate::mutex::{CrossProcessMutex, FileMutex, LockGuard, LockState};
use crate::platform::{
    is_process_alive, map_shared, monotonic_ms, open_existing_shm, open_or_create_shm, unlink_shm,
};
use memmap2::MmapMut;
use serde::Serialize;
use sirius::config::TransportConfig;
use sirius::consts::MAX_SHM_CAPACITY;
use sirius::namespace::shm_name;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Whether `open` may create the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    CreateOrAttach,
    AttachOnly,
}

/// A mapped log segment.
///
/// Exactly one opener of a name is the creator and initializes the header;
/// everyone else validates it. Dropping the segment detaches it, and the last
/// detacher (empty attachment table) removes the shared memory name.
pub struct SharedSegment {
    name: String,
    key: String,
    capacity: usize,
    creator: bool,
    process_mutex: FileMutex,
    #[cfg(not(target_os = "linux"))]
    shm_mutex: FileMutex,
    released: bool,
    mmap: MmapMut,
}

/// Both metadata locks, taken in process → shm order.
///
/// The attachment table can only be reached through this guard.
pub struct MetadataGuard<'a> {
    // Field order is release order: shm first, then process.
    shm: LockGuard<'a>,
    process: LockGuard<'a>,
    segment: &'a SharedSegment,
}

impl MetadataGuard<'_> {
    /// True when either lock reported a dead previous owner.
    pub fn owner_dead(&self) -> bool {
        self.process.state() == LockState::OwnerDead || self.shm.state() == LockState::OwnerDead
    }

    pub(crate) fn header(&self) -> &Header {
        self.segment.header()
    }

    pub(crate) fn segment(&self) -> &SharedSegment {
        self.segment
    }
}

impl SharedSegment {
    /// Open the segment named after `config.key`, creating it if needed.
    pub fn open_or_create(config: &TransportConfig) -> ShmResult<Self> {
        Self::open(config, OpenMode::CreateOrAttach)
    }

    /// Attach to an existing segment; `NotFound` if there is none.
    pub fn attach(config: &TransportConfig) -> ShmResult<Self> {
        Self::open(config, OpenMode::AttachOnly)
    }

    fn open(config: &TransportConfig, mode: OpenMode) -> ShmResult<Self> {
        config.validate()?;
        let name = shm_name(&config.key);
        let lock_dir = config.lock_dir.as_deref();
        let process_mutex = FileMutex::for_name(lock_dir, &config.key)?;
        #[cfg(not(target_os = "linux"))]
        let shm_mutex = FileMutex::for_name(lock_dir, &format!("{}_shm", config.key))?;

        let opened = {
            let _guard = LockGuard::acquire(&process_mutex, &config.key)?;
            open_locked(&name, config.effective_capacity(), mode)
        };
        let (mmap, creator) = opened?;

        let segment = Self {
            capacity: read_capacity(&mmap),
            name,
            key: config.key.clone(),
            creator,
            process_mutex,
            #[cfg(not(target_os = "linux"))]
            shm_mutex,
            released: false,
            mmap,
        };
        info!(
            "{} segment {} ({} slots, {} bytes)",
            if creator { "Created" } else { "Attached to" },
            segment.name,
            segment.capacity,
            segment.mmap.len()
        );
        Ok(segment)
    }

    /// Shared memory object name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical key the name was derived from.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of ring slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this handle created the segment.
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    pub(crate) fn header(&self) -> &Header {
        // SAFETY: the mapping is at least `header_size()` bytes (checked at
        // open), page aligned, and Header only contains atomics.
        unsafe { &*(self.mmap.as_ptr() as *const Header) }
    }

    /// Slot for a 64-bit ring counter.
    pub fn slot(&self, index: u64) -> &Slot {
        let pos = (index as usize) & (self.capacity - 1);
        // SAFETY: pos < capacity and the mapping is segment_size(capacity).
        unsafe {
            let ptr = self.mmap.as_ptr().add(header_size() + pos * SLOT_SIZE);
            &*(ptr as *const Slot)
        }
    }

    fn shm_mutex(&self) -> &dyn CrossProcessMutex {
        #[cfg(target_os = "linux")]
        {
            &self.header().mutex
        }
        #[cfg(not(target_os = "linux"))]
        {
            &self.shm_mutex
        }
    }

    /// Take the process mutex, then the shm mutex.
    pub fn lock_metadata(&self) -> ShmResult<MetadataGuard<'_>> {
        let process = LockGuard::acquire(&self.process_mutex, &self.key)?;
        let shm = LockGuard::acquire(self.shm_mutex(), &self.name)?;
        Ok(MetadataGuard {
            shm,
            process,
            segment: self,
        })
    }

    /// Header stamp present.
    pub fn is_valid(&self) -> bool {
        self.header().magic.load(Ordering::Acquire) == SEGMENT_MAGIC
    }

    /// Clear the header stamp; later openers refuse the segment.
    pub fn invalidate(&self) {
        self.header().magic.store(0, Ordering::Release);
    }

    pub fn daemon_ready(&self) -> bool {
        self.header().daemon_ready.load(Ordering::Acquire) != 0
    }

    pub fn set_daemon_ready(&self, ready: bool) {
        self.header()
            .daemon_ready
            .store(u32::from(ready), Ordering::Release);
    }

    pub fn attached_count(&self) -> u32 {
        self.header().attached_count.load(Ordering::Acquire)
    }

    pub fn write_index(&self) -> u64 {
        self.header().write_index.value.load(Ordering::Acquire)
    }

    pub fn read_index(&self) -> u64 {
        self.header().read_index.value.load(Ordering::Acquire)
    }

    /// Claim the next write index.
    pub(crate) fn claim_index(&self) -> u64 {
        self.header().write_index.value.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn advance_read_index(&self) -> u64 {
        self.header().read_index.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Point-in-time view of the header and attachment table.
    pub fn snapshot(&self) -> SegmentSnapshot {
        let header = self.header();
        let now = monotonic_ms();
        let entries = header
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.role() != Role::None)
            .map(|(index, e)| EntrySnapshot {
                index,
                role: e.role(),
                pid: e.pid(),
                age_ms: now.saturating_sub(e.last_heartbeat_ms()),
                alive: is_process_alive(e.pid()),
            })
            .collect();
        SegmentSnapshot {
            name: self.name.clone(),
            key: self.key.clone(),
            valid: self.is_valid(),
            capacity: self.capacity,
            item_size: header.item_size.load(Ordering::Acquire) as usize,
            write_index: self.write_index(),
            read_index: self.read_index(),
            daemon_ready: self.daemon_ready(),
            attached_count: self.attached_count(),
            entries,
        }
    }

    /// Detach explicitly. Returns whether this call removed the name.
    pub fn detach(mut self) -> ShmResult<bool> {
        self.release()
    }

    fn release(&mut self) -> ShmResult<bool> {
        if self.released {
            return Ok(false);
        }
        // A failed lock leaves the segment unreleased so drop retries.
        let guard = self.lock_metadata()?;
        let remaining = guard.header().attached_count.load(Ordering::Acquire);
        let unlinked = if remaining == 0 {
            unlink_shm(&self.name).map(|()| true)
        } else {
            Ok(false)
        };
        drop(guard);
        self.released = true;
        if unlinked? {
            info!("Last detach, removed segment {}", self.name);
            Ok(true)
        } else {
            debug!("Detached from {} ({} attachments remain)", self.name, remaining);
            Ok(false)
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to detach segment {}: {}", self.name, e);
        }
    }
}

/// JSON-friendly view of a segment, see [`SharedSegment::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct SegmentSnapshot {
    pub name: String,
    pub key: String,
    pub valid: bool,
    pub capacity: usize,
    pub item_size: usize,
    pub write_index: u64,
    pub read_index: u64,
    pub daemon_ready: bool,
    pub attached_count: u32,
    pub entries: Vec<EntrySnapshot>,
}

/// One occupied attachment table entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub index: usize,
    pub role: Role,
    pub pid: u32,
    pub age_ms: u64,
    pub alive: bool,
}

impl SegmentSnapshot {
    pub fn to_json_pretty(&self) -> ShmResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn read_capacity(mmap: &MmapMut) -> usize {
    // SAFETY: validated by open_locked before this is called.
    let header = unsafe { &*(mmap.as_ptr() as *const Header) };
    header.capacity.load(Ordering::Acquire) as usize
}

/// Open, map and initialize or validate. Runs under the process mutex.
fn open_locked(name: &str, capacity: usize, mode: OpenMode) -> ShmResult<(MmapMut, bool)> {
    let size = segment_size(capacity);
    // A stale, invalidated segment is discarded once and recreated.
    for attempt in 0..2 {
        let (file, creator) = match mode {
            OpenMode::CreateOrAttach => open_or_create_shm(name, size)?,
            OpenMode::AttachOnly => (open_existing_shm(name)?, false),
        };
        let mmap = map_shared(&file)?;

        if creator {
            if let Err(e) = initialize(&mmap, capacity) {
                let _ = unlink_shm(name);
                return Err(e);
            }
            return Ok((mmap, true));
        }

        match validate(name, &mmap) {
            Ok(()) => return Ok((mmap, false)),
            Err(e) if attempt == 0 && mode == OpenMode::CreateOrAttach && is_abandoned(&mmap) => {
                warn!("Discarding abandoned segment {}: {}", name, e);
                drop(mmap);
                unlink_shm(name)?;
            }
            Err(e) => return Err(e),
        }
    }
    Err(ShmError::invalid_header(name, "segment could not be recreated"))
}

fn initialize(mmap: &MmapMut, capacity: usize) -> ShmResult<()> {
    if mmap.len() != segment_size(capacity) {
        return Err(ShmError::InvalidSize {
            size: mmap.len(),
            expected: segment_size(capacity),
        });
    }
    // SAFETY: size checked above; no other process can see the header before
    // magic is stored.
    let header = unsafe { &*(mmap.as_ptr() as *const Header) };
    #[cfg(target_os = "linux")]
    // SAFETY: the creator initializes the mutex exactly once.
    unsafe {
        header.mutex.init()?
    };
    for entry in &header.entries {
        entry.clear();
    }
    header.attached_count.store(0, Ordering::Relaxed);
    header.daemon_ready.store(0, Ordering::Relaxed);
    header.write_index.value.store(0, Ordering::Relaxed);
    header.read_index.value.store(0, Ordering::Relaxed);
    for pos in 0..capacity {
        // SAFETY: pos < capacity, slots follow the header.
        let slot = unsafe { &*(mmap.as_ptr().add(header_size() + pos * SLOT_SIZE) as *const Slot) };
        slot.publish(SlotState::Free);
        slot.len.store(0, Ordering::Relaxed);
        slot.turn.store(pos as u64, Ordering::Relaxed);
        slot.sequence.store(0, Ordering::Relaxed);
        slot.timestamp_ms.store(0, Ordering::Relaxed);
    }
    header.capacity.store(capacity as u64, Ordering::Relaxed);
    header.item_size.store(SLOT_SIZE as u64, Ordering::Relaxed);
    header.layout_hash.store(layout_hash(), Ordering::Relaxed);
    header.magic.store(SEGMENT_MAGIC, Ordering::Release);
    Ok(())
}

fn validate(name: &str, mmap: &MmapMut) -> ShmResult<()> {
    if mmap.len() < header_size() {
        return Err(ShmError::invalid_header(
            name,
            format!("mapping of {} bytes is smaller than the header", mmap.len()),
        ));
    }
    // SAFETY: at least header_size() bytes are mapped.
    let header = unsafe { &*(mmap.as_ptr() as *const Header) };
    if header.magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
        return Err(ShmError::invalid_header(name, "bad magic"));
    }
    if header.layout_hash.load(Ordering::Acquire) != layout_hash() {
        return Err(ShmError::invalid_header(name, "layout hash mismatch"));
    }
    let item_size = header.item_size.load(Ordering::Acquire) as usize;
    if item_size != SLOT_SIZE {
        return Err(ShmError::invalid_header(
            name,
            format!("item size {item_size}, expected {SLOT_SIZE}"),
        ));
    }
    let capacity = header.capacity.load(Ordering::Acquire) as usize;
    if capacity == 0 || !capacity.is_power_of_two() || capacity > MAX_SHM_CAPACITY {
        return Err(ShmError::invalid_header(
            name,
            format!("capacity {capacity} is not a valid power of two"),
        ));
    }
    if mmap.len() != segment_size(capacity) {
        return Err(ShmError::invalid_header(
            name,
            format!(
                "mapped {} bytes, layout needs {}",
                mmap.len(),
                segment_size(capacity)
            ),
        ));
    }
    Ok(())
}

/// Unstamped header and no live process in its table.
fn is_abandoned(mmap: &MmapMut) -> bool {
    if mmap.len() < header_size() {
        return true;
    }
    // SAFETY: at least header_size() bytes are mapped.
    let header = unsafe { &*(mmap.as_ptr() as *const Header) };
    header.magic.load(Ordering::Acquire) == 0
        && header
            .entries
            .iter()
            .all(|e| e.role() == Role::None || !is_process_alive(e.pid()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_config(tag: &str) -> (TempDir, TransportConfig) {
        let dir = tempfile::tempdir().unwrap();
        let key = format!(
            "seg_{}_{}_{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let config = TransportConfig::with_key(key)
            .lock_dir(dir.path())
            .capacity(8);
        (dir, config)
    }

    #[test]
    fn test_creator_then_attacher() {
        let (_dir, config) = test_config("elect");
        let first = SharedSegment::open_or_create(&config).unwrap();
        let second = SharedSegment::open_or_create(&config).unwrap();

        assert!(first.is_creator());
        assert!(!second.is_creator());
        assert!(second.is_valid());
        assert_eq!(second.capacity(), 8);
        assert_eq!(first.name(), second.name());
    }

    #[test]
    fn test_slot_turns_initialized() {
        let (_dir, config) = test_config("turns");
        let segment = SharedSegment::open_or_create(&config).unwrap();
        for i in 0..8u64 {
            let slot = segment.slot(i);
            assert_eq!(slot.turn.load(Ordering::Acquire), i);
            assert_eq!(slot.state(), Some(SlotState::Free));
        }
        // Counters wrap onto the ring.
        assert!(std::ptr::eq(segment.slot(3), segment.slot(11)));
    }

    #[test]
    fn test_capacity_rounded_up() {
        let (_dir, config) = test_config("round");
        let segment = SharedSegment::open_or_create(&config.capacity(5)).unwrap();
        assert_eq!(segment.capacity(), 8);
    }

    #[test]
    fn test_attach_missing_segment() {
        let (_dir, config) = test_config("missing");
        assert!(matches!(
            SharedSegment::attach(&config),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn test_attacher_rejects_bad_magic() {
        let (_dir, config) = test_config("magic");
        let creator = SharedSegment::open_or_create(&config).unwrap();
        // Keep one live entry so the segment is not treated as abandoned.
        creator.header().entries[0]
            .pid
            .store(std::process::id(), Ordering::Release);
        creator.header().entries[0]
            .role
            .store(Role::Native as u32, Ordering::Release);
        creator.header().attached_count.store(1, Ordering::Release);
        creator.invalidate();

        let result = SharedSegment::attach(&config);
        assert!(matches!(result, Err(ShmError::InvalidHeader { .. })));
        let result = SharedSegment::open_or_create(&config);
        assert!(matches!(result, Err(ShmError::InvalidHeader { .. })));

        creator.header().entries[0].clear();
        creator.header().attached_count.store(0, Ordering::Release);
    }

    #[test]
    fn test_attacher_rejects_layout_mismatch() {
        let (_dir, config) = test_config("layout");
        let creator = SharedSegment::open_or_create(&config).unwrap();
        creator
            .header()
            .layout_hash
            .store(layout_hash() ^ 1, Ordering::Release);

        let err = SharedSegment::attach(&config).err().unwrap();
        assert!(err.to_string().contains("layout hash"));
    }

    #[test]
    fn test_abandoned_segment_is_recreated() {
        let (_dir, config) = test_config("abandoned");
        let mut stale = SharedSegment::open_or_create(&config).unwrap();
        stale.invalidate();
        // Leave the name behind without unlinking.
        stale.released = true;
        drop(stale);

        let fresh = SharedSegment::open_or_create(&config).unwrap();
        assert!(fresh.is_creator());
        assert!(fresh.is_valid());
    }

    #[test]
    fn test_failed_detach_lock_is_retried() {
        // Writes to /dev/full fail, so locking through it fails.
        let Ok(broken) = FileMutex::open(std::path::Path::new("/dev/full")) else {
            return;
        };
        let (_dir, config) = test_config("retry_detach");
        let mut segment = SharedSegment::open_or_create(&config).unwrap();
        let healthy = std::mem::replace(&mut segment.process_mutex, broken);

        assert!(matches!(segment.release(), Err(ShmError::Lock { .. })));
        assert!(!segment.released);

        segment.process_mutex = healthy;
        assert!(segment.release().unwrap());
        assert!(matches!(
            SharedSegment::attach(&config),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn test_last_detach_unlinks() {
        let (_dir, config) = test_config("unlink");
        let first = SharedSegment::open_or_create(&config).unwrap();
        let second = SharedSegment::attach(&config).unwrap();

        second.header().attached_count.store(1, Ordering::Release);
        assert!(!second.detach().unwrap());
        first.header().attached_count.store(0, Ordering::Release);
        assert!(first.detach().unwrap());

        assert!(matches!(
            SharedSegment::attach(&config),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn test_metadata_guard_reports_clean_locks() {
        let (_dir, config) = test_config("guard");
        let segment = SharedSegment::open_or_create(&config).unwrap();
        let guard = segment.lock_metadata().unwrap();
        assert!(!guard.owner_dead());
        drop(guard);
        // Re-lockable after release.
        assert!(segment.lock_metadata().is_ok());
    }

    #[test]
    fn test_snapshot_serializes() {
        let (_dir, config) = test_config("snapshot");
        let segment = SharedSegment::open_or_create(&config).unwrap();
        let snapshot = segment.snapshot();
        assert!(snapshot.valid);
        assert_eq!(snapshot.capacity, 8);
        assert_eq!(snapshot.item_size, SLOT_SIZE);
        assert!(snapshot.entries.is_empty());
        let json = snapshot.to_json_pretty().unwrap();
        assert!(json.contains("\"daemon_ready\": false"));
    }
}
