//! System-wide constants for the sirius workspace.
//!
//! Single source of truth for build-time identity, layout limits and timing
//! defaults. Imported by all crates; do not duplicate these values.

/// Namespace every shared object name is derived from.
pub const NAMESPACE: &str = "sirius";

/// Permissions of created lock files and shared memory objects, as text.
///
/// Part of the name hash, so two builds with different modes never share
/// a segment.
pub const POSIX_FILE_MODE: &str = "0775";

/// Numeric form of [`POSIX_FILE_MODE`].
pub const POSIX_FILE_MODE_BITS: u32 = 0o775;

/// User-configurable build key mixed into every name hash.
pub const USER_KEY: &str = "d32d87be6fe35062a7945ffd4f4a69d4";

/// Logical key of the log transport segment.
pub const DEFAULT_LOG_KEY: &str = "utils_log";

/// Salt for the daemon spawn token.
pub const DAEMON_ARG_SALT: &str = "utils_log_daemon_arg";

/// File name of the daemon executable.
pub const DAEMON_EXE_NAME: &str = "sirius_daemon";

/// Default install directory of the daemon executable.
pub const DEFAULT_EXE_DIR: &str = "/usr/bin";

/// Environment variable overriding the daemon executable path.
pub const ENV_DAEMON_PATH: &str = "SIRIUS_ENV_EXE_DAEMON_PATH";

/// CPU cache line size in bytes.
///
/// Header sections and slots are aligned to this to avoid false sharing.
pub const CACHE_LINE_SIZE: usize = 64;

/// Size of the attachment table (maximum attached processes).
pub const PROCESS_MAX: usize = 128;

/// Attached entries left when only the daemon remains.
pub const DAEMON_ONLY_FLOOR: u32 = 1;

/// Default ring capacity in slots (power of two).
pub const DEFAULT_SHM_CAPACITY: usize = 512;

/// Largest accepted ring capacity in slots.
pub const MAX_SHM_CAPACITY: usize = 65_536;

/// Default heartbeat period of an attachment, in milliseconds.
pub const PROCESS_FEED_GUARD_MS: u64 = 2_000;

/// Heartbeat age after which a native entry is pruned, in milliseconds.
pub const PROCESS_GUARD_TIMEOUT_MS: u64 = 10_000;

/// Age after which a slot stuck in `Writing` is recovered, in milliseconds.
pub const SHM_SLOT_RESET_TIMEOUT_MS: u64 = 10_000;

/// Watchdog scan period, in milliseconds.
pub const WATCHDOG_INTERVAL_MS: u64 = 1_000;

/// Daemon housekeeping period, in milliseconds.
pub const HOUSEKEEPING_INTERVAL_MS: u64 = 100;

/// Time the consumer waits on an unclaimed slot before skipping it.
pub const CLAIM_TIMEOUT_MS: u64 = 500;

/// Readiness poll attempts during bootstrap.
pub const BOOTSTRAP_RETRIES: u32 = 600;

/// Readiness poll period during bootstrap, in milliseconds.
pub const BOOTSTRAP_INTERVAL_MS: u64 = 10;

/// Cool-down after a failed initialization, in milliseconds.
pub const INIT_COOLDOWN_MS: u64 = 30_000;

/// Time a daemon that never saw a native waits before exiting.
pub const IDLE_EXIT_GRACE_MS: u64 = 5_000;

/// Round `n` up to the next power of two (`0` maps to `1`).
pub const fn next_power_of_two(n: usize) -> usize {
    if n <= 1 {
        return 1;
    }
    let mut p = 1usize;
    while p < n {
        p <<= 1;
    }
    p
}
