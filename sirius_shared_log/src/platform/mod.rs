//! POSIX shared memory, process and clock helpers
//!
//! Everything that touches a raw system call lives here or in the per-OS
//! submodule, so the rest of the crate stays platform-agnostic.

#[cfg(target_os = "linux")]
pub mod linux;

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::time::{ClockId, clock_gettime};
use nix::unistd::getpid;
use sirius::consts::POSIX_FILE_MODE_BITS;
use std::fs::{File, OpenOptions, Permissions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(Errno::ESRCH) => false,
        // Exists, but belongs to another user.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// System-wide monotonic clock in milliseconds.
///
/// Comparable between processes on the same boot, unlike `Instant`.
pub fn monotonic_ms() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000 + ts.tv_nsec() as u64 / 1_000_000)
        .unwrap_or_default()
}

fn shm_mode() -> Mode {
    Mode::from_bits_truncate(POSIX_FILE_MODE_BITS as _)
}

/// Open the named shared memory object, creating it with `size` bytes when
/// it does not exist. Returns the object and whether this call created it.
pub fn open_or_create_shm(name: &str, size: usize) -> ShmResult<(File, bool)> {
    let create = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
    match shm_open(name, create, shm_mode()) {
        Ok(fd) => {
            let file = File::from(fd);
            // umask may have stripped group bits from the requested mode.
            file.set_permissions(Permissions::from_mode(POSIX_FILE_MODE_BITS))?;
            if let Err(e) = file.set_len(size as u64) {
                let _ = shm_unlink(name);
                return Err(e.into());
            }
            Ok((file, true))
        }
        Err(Errno::EEXIST) => {
            let fd = shm_open(name, OFlag::O_RDWR, shm_mode())?;
            Ok((File::from(fd), false))
        }
        Err(e) => Err(e.into()),
    }
}

/// Open an existing shared memory object without creating it.
pub fn open_existing_shm(name: &str) -> ShmResult<File> {
    match shm_open(name, OFlag::O_RDWR, shm_mode()) {
        Ok(fd) => Ok(File::from(fd)),
        Err(Errno::ENOENT) => Err(ShmError::NotFound {
            name: name.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Remove the shared memory object name. Already-removed is not an error.
pub fn unlink_shm(name: &str) -> ShmResult<()> {
    match shm_unlink(name) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Map the whole object read-write and shared.
pub fn map_shared(file: &File) -> ShmResult<MmapMut> {
    // SAFETY: the mapping is only accessed through the atomic header and
    // slot accessors of `SharedSegment`.
    let mmap = unsafe { MmapOptions::new().map_mut(file)? };
    Ok(mmap)
}

/// Open (creating if needed) a lock file with the namespace file mode.
pub fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(POSIX_FILE_MODE_BITS)
        .open(path)
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: flock on a descriptor owned by `file`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Block until the exclusive advisory lock of `file` is held.
pub fn lock_exclusive(file: &File) -> io::Result<()> {
    flock(file, libc::LOCK_EX)
}

/// Release the advisory lock of `file`.
pub fn unlock_file(file: &File) -> io::Result<()> {
    flock(file, libc::LOCK_UN)
}
