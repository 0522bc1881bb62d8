//! Crash-detectable cross-process mutual exclusion
//!
//! Two implementations share the [`CrossProcessMutex`] trait:
//!
//! - [`FileMutex`]: an advisory `flock` on a lock file whose first bytes hold
//!   a `{dirty, owner_pid}` record. A set dirty flag on acquisition means
//!   the previous holder died inside its critical section.
//! - `RobustMutex` (Linux, see [`crate::platform::linux`]): a robust
//!   process-shared pthread mutex inside the segment header.
//!
//! A dead owner never blocks progress: the lock is granted, the condition is
//! reported as [`LockState::OwnerDead`] and logged by [`LockGuard`].

use crate::error::{ShmError, ShmResult};
use crate::platform::{get_current_pid, lock_exclusive, open_lock_file, unlock_file};
use parking_lot::lock_api::RawMutex as _;
use sirius::namespace::{lock_file_path, resolve_lock_dir};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Outcome of a successful lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Lock acquired normally
    Success,
    /// Lock acquired, but the previous owner died while holding it
    OwnerDead,
}

/// A named lock shared between processes.
///
/// `lock` blocks until the lock is held; failure to lock is the `Err` arm.
pub trait CrossProcessMutex: Send + Sync {
    /// Acquire the lock.
    fn lock(&self) -> ShmResult<LockState>;
    /// Release a lock held by the caller.
    fn unlock(&self) -> ShmResult<()>;
}

/// RAII guard releasing a [`CrossProcessMutex`] on drop.
pub struct LockGuard<'a> {
    mutex: &'a dyn CrossProcessMutex,
    state: LockState,
}

impl<'a> LockGuard<'a> {
    /// Lock `mutex`; `name` only labels diagnostics.
    pub fn acquire(mutex: &'a dyn CrossProcessMutex, name: &str) -> ShmResult<Self> {
        let state = mutex.lock()?;
        if state == LockState::OwnerDead {
            warn!("Previous owner of lock {} died while holding it", name);
        }
        Ok(Self { mutex, state })
    }

    /// How the lock was acquired.
    pub fn state(&self) -> LockState {
        self.state
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            warn!("Failed to release lock: {}", e);
        }
    }
}

/// Offset of the owner pid in the lock file record.
const OWNER_PID_OFFSET: usize = 8;
/// Size of the lock file record: `{dirty: u8, _pad: [u8; 7], owner_pid: u64}`.
const LOCK_RECORD_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct LockRecord {
    dirty: bool,
    owner_pid: u64,
}

impl LockRecord {
    fn encode(self) -> [u8; LOCK_RECORD_LEN] {
        let mut buf = [0u8; LOCK_RECORD_LEN];
        buf[0] = u8::from(self.dirty);
        buf[OWNER_PID_OFFSET..].copy_from_slice(&self.owner_pid.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        // Short or empty files come from first creation.
        if buf.len() < LOCK_RECORD_LEN {
            return Self::default();
        }
        let mut pid = [0u8; 8];
        pid.copy_from_slice(&buf[OWNER_PID_OFFSET..LOCK_RECORD_LEN]);
        Self {
            dirty: buf[0] == 1,
            owner_pid: u64::from_le_bytes(pid),
        }
    }
}

/// Lock-file mutex with owner-death detection.
///
/// `flock` locks belong to the open file description, so threads sharing one
/// `FileMutex` are additionally serialized by an in-process raw mutex.
pub struct FileMutex {
    path: PathBuf,
    file: File,
    local: parking_lot::RawMutex,
    held: AtomicBool,
}

impl FileMutex {
    /// Open or create the lock file at `path`.
    pub fn open(path: &Path) -> ShmResult<Self> {
        let file = open_lock_file(path).map_err(|e| ShmError::Lock {
            name: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!("Opened lock file {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
            local: parking_lot::RawMutex::INIT,
            held: AtomicBool::new(false),
        })
    }

    /// Lock file for the logical `name`, placed in the resolved lock directory.
    pub fn for_name(lock_dir: Option<&Path>, name: &str) -> ShmResult<Self> {
        let base = resolve_lock_dir(lock_dir)?;
        Self::open(&lock_file_path(&base, name))
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_record(&self) -> io::Result<LockRecord> {
        let mut buf = [0u8; LOCK_RECORD_LEN];
        let mut filled = 0;
        while filled < LOCK_RECORD_LEN {
            match self.file.read_at(&mut buf[filled..], filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(LockRecord::decode(&buf[..filled]))
    }

    fn write_record(&self, record: LockRecord) -> io::Result<()> {
        self.file.write_all_at(&record.encode(), 0)?;
        self.file.sync_data()
    }

    fn lock_error(&self, reason: impl ToString) -> ShmError {
        ShmError::Lock {
            name: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    fn acquire_os_lock(&self) -> ShmResult<LockState> {
        lock_exclusive(&self.file).map_err(|e| self.lock_error(e))?;
        let entered = self.read_record().and_then(|previous| {
            self.write_record(LockRecord {
                dirty: true,
                owner_pid: u64::from(get_current_pid()),
            })
            .map(|()| previous)
        });
        match entered {
            Ok(previous) if previous.dirty => {
                debug!(
                    "Lock {} was left dirty by pid {}",
                    self.path.display(),
                    previous.owner_pid
                );
                Ok(LockState::OwnerDead)
            }
            Ok(_) => Ok(LockState::Success),
            Err(e) => {
                let _ = unlock_file(&self.file);
                Err(self.lock_error(e))
            }
        }
    }
}

impl CrossProcessMutex for FileMutex {
    fn lock(&self) -> ShmResult<LockState> {
        self.local.lock();
        match self.acquire_os_lock() {
            Ok(state) => {
                self.held.store(true, Ordering::Release);
                Ok(state)
            }
            Err(e) => {
                // SAFETY: locked above by this call.
                unsafe { self.local.unlock() };
                Err(e)
            }
        }
    }

    fn unlock(&self) -> ShmResult<()> {
        if !self.held.swap(false, Ordering::AcqRel) {
            return Err(self.lock_error("unlock without a matching lock"));
        }
        let cleared = self.write_record(LockRecord::default());
        let released = unlock_file(&self.file);
        // SAFETY: `held` was set, so the raw mutex is locked.
        unsafe { self.local.unlock() };
        cleared.map_err(|e| self.lock_error(e))?;
        released.map_err(|e| self.lock_error(e))
    }
}
