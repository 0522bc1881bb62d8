//! Producer example: several threads logging through the shared transport
//!
//! Spawns the daemon on first use (set `SIRIUS_ENV_EXE_DAEMON_PATH` when
//! `sirius_daemon` is not installed) and falls back to direct writes when
//! no daemon becomes ready.

use sirius::config::{LogLevel, TransportConfig};
use sirius_shared_log::{LogService, init_tracing};
use std::sync::Arc;

fn main() {
    init_tracing();

    let config = TransportConfig::with_key("example_log").capacity(64);
    let service = Arc::new(LogService::new(config));

    match service.init() {
        Ok(()) => println!("Connected to the log daemon"),
        Err(e) => println!("Writing directly, daemon unavailable: {e}"),
    }

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let service = Arc::clone(&service);
            std::thread::spawn(move || {
                for n in 0..10 {
                    let level = if n % 5 == 4 { LogLevel::Warn } else { LogLevel::Info };
                    service.write(level, &format!("worker {worker} message {n}\n"));
                }
            })
        })
        .collect();
    for worker in workers {
        let _ = worker.join();
    }

    service.shutdown();
}
