//! Helpers shared by the integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use sirius::config::TransportConfig;
use sirius_shared_log::{Record, RecordSink};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Config for a private segment; the TempDir holds its lock files.
pub fn test_config(tag: &str, capacity: usize) -> (TempDir, TransportConfig) {
    let dir = tempfile::tempdir().unwrap();
    let key = format!(
        "it_{}_{}_{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let mut config = TransportConfig::with_key(key)
        .lock_dir(dir.path())
        .capacity(capacity)
        .spawn_daemon(false);
    config.housekeeping_interval_ms = 10;
    config.heartbeat_interval_ms = 50;
    config.bootstrap_retries = 50;
    config.bootstrap_interval_ms = 2;
    config.idle_exit_grace_ms = 60_000;
    (dir, config)
}

/// Collects delivered records in memory.
#[derive(Clone, Default)]
pub struct VecSink {
    pub records: Arc<Mutex<Vec<(u64, Record)>>>,
}

impl VecSink {
    pub fn boxed(&self) -> Box<dyn RecordSink> {
        Box::new(self.clone())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn texts(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter_map(|(_, record)| match record {
                Record::Log(log) => Some(String::from_utf8_lossy(&log.text).into_owned()),
                Record::Config(_) => None,
            })
            .collect()
    }
}

impl RecordSink for VecSink {
    fn deliver(&mut self, sequence: u64, record: &Record) -> io::Result<()> {
        self.records.lock().push((sequence, record.clone()));
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
