//! Locating, spawning and waiting for the log daemon

use crate::attachment::Attachment;
use crate::error::{ShmError, ShmResult};
use crate::layout::Role;
use crate::platform::{get_current_pid, monotonic_ms};
use crate::segment::SharedSegment;
use sirius::config::TransportConfig;
use sirius::consts::{DAEMON_EXE_NAME, DEFAULT_EXE_DIR, ENV_DAEMON_PATH};
use sirius::namespace::{daemon_config_path, daemon_spawn_token, resolve_lock_dir};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts between two progress messages while waiting for the daemon.
const PROGRESS_EVERY: u32 = 100;

/// Daemon executable candidates in lookup order.
pub fn daemon_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(ENV_DAEMON_PATH).filter(|v| !v.is_empty()) {
        candidates.push(PathBuf::from(path));
    }
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        candidates.push(dir.join(DAEMON_EXE_NAME));
    }
    candidates.push(Path::new(DEFAULT_EXE_DIR).join(DAEMON_EXE_NAME));
    candidates
}

/// First existing daemon executable.
pub fn locate_daemon(explicit: Option<&Path>) -> ShmResult<PathBuf> {
    daemon_candidates(explicit)
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| ShmError::NotFound {
            name: DAEMON_EXE_NAME.to_string(),
        })
}

/// Write `config` where a spawned daemon loads it from; returns the path.
pub fn write_daemon_config(config: &TransportConfig) -> ShmResult<PathBuf> {
    let base = resolve_lock_dir(config.lock_dir.as_deref())?;
    let path = daemon_config_path(&base, &config.key);
    // Renamed into place so a starting daemon never reads a partial file.
    let staging = path.with_extension(format!("toml.{}", get_current_pid()));
    std::fs::write(&staging, toml::to_string(config)?)?;
    std::fs::rename(&staging, &path)?;
    debug!("Wrote daemon config {}", path.display());
    Ok(path)
}

/// Start the daemon detached in its own process group; returns its pid.
pub fn spawn_daemon(exe: &Path, config: &TransportConfig) -> ShmResult<u32> {
    let config_path = write_daemon_config(config)?;
    let mut command = Command::new(exe);
    command
        .arg("--spawn")
        .arg(daemon_spawn_token())
        .arg("--config")
        .arg(&config_path)
        .arg("--key")
        .arg(&config.key)
        .arg("--capacity")
        .arg(config.effective_capacity().to_string());
    if let Some(dir) = &config.lock_dir {
        command.arg("--lock-dir").arg(dir);
    }
    command.stdin(Stdio::null()).process_group(0);

    let mut child = command.spawn()?;
    let pid = child.id();
    info!("Spawned log daemon {} (pid {})", exe.display(), pid);
    // Reap the daemon whenever it exits.
    let reaper = std::thread::Builder::new()
        .name("sirius-daemon-reaper".to_string())
        .spawn(move || match child.wait() {
            Ok(status) => debug!("Log daemon {} exited: {}", pid, status),
            Err(e) => warn!("Failed to reap log daemon {}: {}", pid, e),
        });
    if let Err(e) = reaper {
        warn!("No reaper thread for log daemon {}: {}", pid, e);
    }
    Ok(pid)
}

/// Ready flag set and a live daemon entry in the table.
fn daemon_serving(segment: &SharedSegment, config: &TransportConfig) -> ShmResult<bool> {
    let guard = segment.lock_metadata()?;
    let live = guard
        .table()
        .live_daemon(monotonic_ms(), config.process_guard_timeout_ms);
    Ok(segment.daemon_ready() && live.is_some())
}

/// Poll for a serving daemon within the bootstrap budget.
pub fn wait_for_daemon(segment: &SharedSegment, config: &TransportConfig) -> ShmResult<()> {
    for attempt in 0..config.bootstrap_retries {
        if daemon_serving(segment, config)? {
            debug!("Log daemon ready after {} attempts", attempt);
            return Ok(());
        }
        if attempt > 0 && attempt % PROGRESS_EVERY == 0 {
            info!(
                "Waiting for log daemon ({}/{})",
                attempt, config.bootstrap_retries
            );
        }
        std::thread::sleep(config.bootstrap_interval());
    }
    if daemon_serving(segment, config)? {
        return Ok(());
    }
    Err(ShmError::DaemonUnavailable {
        reason: format!(
            "not ready after {} attempts of {} ms",
            config.bootstrap_retries, config.bootstrap_interval_ms
        ),
    })
}

/// Open the segment, register as native and make sure a daemon serves it.
pub(crate) fn attach_native(config: &TransportConfig) -> ShmResult<(Arc<SharedSegment>, Attachment)> {
    let segment = Arc::new(SharedSegment::open_or_create(config)?);
    let live = {
        let guard = segment.lock_metadata()?;
        let live = guard
            .table()
            .live_daemon(monotonic_ms(), config.process_guard_timeout_ms);
        // A daemon clears the flag before freeing its entry.
        if live.is_none() && segment.daemon_ready() {
            warn!("Clearing stale ready flag on {}", segment.name());
            segment.set_daemon_ready(false);
        }
        live
    };
    let attachment = Attachment::register(Arc::clone(&segment), Role::Native, config)?;

    if live.is_none() {
        if config.spawn_daemon {
            let exe = locate_daemon(config.daemon_path.as_deref())?;
            spawn_daemon(&exe, config)?;
        } else {
            debug!("No live daemon on {} and spawning is disabled", segment.name());
        }
    }

    wait_for_daemon(&segment, config)?;
    attachment.mark_daemon_seen();
    Ok((segment, attachment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sirius::config::ConfigLoader;

    #[test]
    fn test_explicit_path_comes_first() {
        let candidates = daemon_candidates(Some(Path::new("/opt/custom/sirius_daemon")));
        assert_eq!(candidates[0], PathBuf::from("/opt/custom/sirius_daemon"));
        assert_eq!(
            candidates.last().unwrap(),
            &PathBuf::from("/usr/bin/sirius_daemon")
        );
    }

    #[test]
    fn test_locate_skips_missing_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("sirius_daemon");
        std::fs::write(&exe, b"#!/bin/sh\n").unwrap();

        let missing = dir.path().join("missing_daemon");
        let found = locate_daemon(Some(&exe)).unwrap();
        assert_eq!(found, exe);
        // A missing explicit path falls through to the other candidates.
        if let Ok(found) = locate_daemon(Some(&missing)) {
            assert_ne!(found, missing);
        }
    }

    #[test]
    fn test_wait_for_daemon_exhausts_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TransportConfig::with_key(format!("boot_wait_{}", std::process::id()))
            .lock_dir(dir.path())
            .capacity(2);
        config.bootstrap_retries = 3;
        config.bootstrap_interval_ms = 1;
        let segment = SharedSegment::open_or_create(&config).unwrap();

        let result = wait_for_daemon(&segment, &config);
        assert!(matches!(result, Err(ShmError::DaemonUnavailable { .. })));

        segment.set_daemon_ready(true);
        // A bare flag without a daemon entry is not enough.
        assert!(wait_for_daemon(&segment, &config).is_err());

        let pid = get_current_pid();
        let index = {
            let guard = segment.lock_metadata().unwrap();
            guard.table().alloc(Role::Daemon, pid, monotonic_ms()).unwrap()
        };
        assert!(wait_for_daemon(&segment, &config).is_ok());
        segment.set_daemon_ready(false);
        segment.lock_metadata().unwrap().table().free(index, pid);
    }

    #[test]
    fn test_ready_flag_of_dead_daemon_is_not_serving() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TransportConfig::with_key(format!("boot_dead_{}", std::process::id()))
            .lock_dir(dir.path())
            .capacity(2);
        config.bootstrap_retries = 3;
        config.bootstrap_interval_ms = 1;
        let segment = SharedSegment::open_or_create(&config).unwrap();
        {
            let guard = segment.lock_metadata().unwrap();
            guard
                .table()
                .alloc(Role::Daemon, i32::MAX as u32, monotonic_ms())
                .unwrap();
        }
        segment.set_daemon_ready(true);

        assert!(!daemon_serving(&segment, &config).unwrap());
        assert!(matches!(
            wait_for_daemon(&segment, &config),
            Err(ShmError::DaemonUnavailable { .. })
        ));
        segment.set_daemon_ready(false);
    }

    #[test]
    fn test_daemon_config_carries_timings() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TransportConfig::with_key("boot_forward")
            .lock_dir(dir.path())
            .capacity(16);
        config.heartbeat_interval_ms = 40;
        config.process_guard_timeout_ms = 400;
        config.claim_timeout_ms = 75;
        config.housekeeping_interval_ms = 15;
        config.idle_exit_grace_ms = 900;

        let path = write_daemon_config(&config).unwrap();
        assert!(path.starts_with(dir.path()));
        let loaded = TransportConfig::load(&path).unwrap();
        assert_eq!(loaded.heartbeat_interval_ms, 40);
        assert_eq!(loaded.process_guard_timeout_ms, 400);
        assert_eq!(loaded.claim_timeout_ms, 75);
        assert_eq!(loaded.housekeeping_interval_ms, 15);
        assert_eq!(loaded.idle_exit_grace_ms, 900);
        assert_eq!(loaded, config);
    }
}
