//! Linux-specific primitives: the process-shared robust mutex

use crate::error::{ShmError, ShmResult};
use crate::mutex::{CrossProcessMutex, LockState};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

/// Process-shared robust `pthread_mutex_t`, placed inside the segment header.
///
/// When a holder dies, the kernel marks the mutex and the next `lock`
/// reports [`LockState::OwnerDead`] after making it consistent again.
#[repr(C)]
pub struct RobustMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes are designed to be shared between threads and,
// with PTHREAD_PROCESS_SHARED, between processes.
unsafe impl Send for RobustMutex {}
unsafe impl Sync for RobustMutex {}

fn check(rc: libc::c_int, op: &str) -> ShmResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ShmError::Lock {
            name: "robust mutex".to_string(),
            reason: format!("{op}: {}", std::io::Error::from_raw_os_error(rc)),
        })
    }
}

impl RobustMutex {
    /// Initialize the mutex in place as process-shared and robust.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, by the segment creator, before any other
    /// process can observe the segment.
    pub unsafe fn init(&self) -> ShmResult<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: attr is initialized by pthread_mutexattr_init before use
        // and destroyed on every path.
        unsafe {
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()), "mutexattr_init")?;
            let configured = check(
                libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
                "setpshared",
            )
            .and_then(|()| {
                check(
                    libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST),
                    "setrobust",
                )
            })
            .and_then(|()| check(libc::pthread_mutex_init(self.inner.get(), attr.as_ptr()), "mutex_init"));
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            configured
        }
    }
}

impl CrossProcessMutex for RobustMutex {
    fn lock(&self) -> ShmResult<LockState> {
        // SAFETY: the mutex was initialized by the segment creator.
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        match rc {
            0 => Ok(LockState::Success),
            libc::EOWNERDEAD => {
                // SAFETY: we hold the mutex after EOWNERDEAD.
                let rc = unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
                check(rc, "mutex_consistent")?;
                Ok(LockState::OwnerDead)
            }
            rc => check(rc, "mutex_lock").map(|()| LockState::Success),
        }
    }

    fn unlock(&self) -> ShmResult<()> {
        // SAFETY: only called by the holder through `LockGuard`.
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        check(rc, "mutex_unlock")
    }
}
