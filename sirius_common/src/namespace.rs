//! Hashed names for shared memory objects, lock files and the daemon token.
//!
//! Names never carry the raw build configuration. They combine the namespace
//! with an FNV-1a digest of the namespace, file mode and user key.

use crate::consts::{DAEMON_ARG_SALT, NAMESPACE, POSIX_FILE_MODE, POSIX_FILE_MODE_BITS, USER_KEY};
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a hash of `s`.
pub fn fnv1a64(s: &str) -> u64 {
    s.bytes().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `ns_` followed by the 16 hex digits of the namespace digest.
///
/// An empty `salt` yields the plain namespace prefix.
pub fn namespace_prefix(salt: &str) -> String {
    let mut material = format!("{NAMESPACE}|{POSIX_FILE_MODE}|{USER_KEY}");
    if !salt.is_empty() {
        material.push('|');
        material.push_str(salt);
    }
    format!("ns_{:016x}", fnv1a64(&material.to_lowercase()))
}

/// Name of the shared memory object for a logical key.
pub fn shm_name(key: &str) -> String {
    format!("/{NAMESPACE}_{}_{}", namespace_prefix(""), sanitize_name(key))
}

/// Lock file of `name` below `base`.
pub fn lock_file_path(base: &Path, name: &str) -> PathBuf {
    base.join(NAMESPACE)
        .join(format!("{}_{}.lock", namespace_prefix(""), sanitize_name(name)))
}

/// Transport config handed to a spawned daemon for `key`.
pub fn daemon_config_path(base: &Path, key: &str) -> PathBuf {
    base.join(NAMESPACE).join(format!(
        "{}_{}.daemon.toml",
        namespace_prefix(""),
        sanitize_name(key)
    ))
}

/// Candidate base directories for lock files, in priority order.
pub fn lock_dir_candidates() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from("/var/run")];
    if let Some(xdg) = std::env::var_os("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
        dirs.push(PathBuf::from(xdg));
    }
    dirs.push(PathBuf::from("/var/tmp"));
    dirs.push(std::env::temp_dir());
    dirs
}

/// First base directory in which the namespace directory exists or can be
/// created. An explicit `override_dir` is the only candidate when given.
pub fn resolve_lock_dir(override_dir: Option<&Path>) -> io::Result<PathBuf> {
    let candidates = match override_dir {
        Some(dir) => vec![dir.to_path_buf()],
        None => lock_dir_candidates(),
    };

    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no lock directory candidate");
    for base in candidates {
        let ns_dir = base.join(NAMESPACE);
        let created = DirBuilder::new()
            .recursive(true)
            .mode(POSIX_FILE_MODE_BITS)
            .create(&ns_dir);
        match created {
            Ok(()) if is_writable_dir(&ns_dir) => return Ok(base),
            Ok(()) => {
                last_err = io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{} is not writable", ns_dir.display()),
                );
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn is_writable_dir(dir: &Path) -> bool {
    nix::unistd::access(dir, nix::unistd::AccessFlags::W_OK).is_ok()
}

/// Token a daemon must receive on its command line.
pub fn daemon_spawn_token() -> String {
    format!("{NAMESPACE}_{}", namespace_prefix(DAEMON_ARG_SALT))
}
