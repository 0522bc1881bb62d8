//! Process-wide logging facade over the native transport
//!
//! One `LogService` is constructed at startup and owned by the application.
//! Writes never fail: without a ready daemon they go straight to the
//! process's own stdout/stderr or configured files.

use crate::error::{ShmError, ShmResult};
use crate::producer::{Delivery, NativeTransport};
use crate::record::{ConfigRecord, Record};
use crate::sink::{FdSink, FileMode, RecordSink};
use parking_lot::{Mutex, RwLock};
use sirius::config::{LogLevel, TransportConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

pub struct LogService {
    config: Mutex<TransportConfig>,
    initialized: AtomicBool,
    /// Serializes connection attempts.
    init_lock: Mutex<Option<Instant>>,
    transport: RwLock<Option<NativeTransport>>,
    fallback: Mutex<FdSink>,
}

impl LogService {
    /// Build the service; nothing is opened until the first `init` or write.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config: Mutex::new(config),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(None),
            transport: RwLock::new(None),
            fallback: Mutex::new(FdSink::new(FileMode::Append)),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Connected and the daemon is serving.
    pub fn is_connected(&self) -> bool {
        self.transport
            .read()
            .as_ref()
            .is_some_and(NativeTransport::is_available)
    }

    /// Connect to (or start) the daemon.
    ///
    /// After a failure no new attempt is made until the cool-down expires.
    pub fn init(&self) -> ShmResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let mut retry_after = self.init_lock.lock();
        if self.is_initialized() {
            return Ok(());
        }
        if let Some(at) = *retry_after {
            if Instant::now() < at {
                return Err(ShmError::DaemonUnavailable {
                    reason: "cooling down after a failed initialization".to_string(),
                });
            }
        }

        let config = self.config.lock().clone();
        match NativeTransport::connect(&config) {
            Ok(transport) => {
                *self.transport.write() = Some(transport);
                *retry_after = None;
                self.initialized.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Log transport unavailable, writing directly for {} ms: {}",
                    config.init_cooldown_ms, e
                );
                *retry_after = Some(Instant::now() + config.init_cooldown());
                Err(e)
            }
        }
    }

    /// Write one log record. Text is written as given.
    pub fn write(&self, level: LogLevel, text: &str) {
        self.dispatch(&Record::log(level, text.as_bytes()));
    }

    fn dispatch(&self, record: &Record) {
        if !self.is_initialized() {
            let _ = self.init();
        }
        let delivery = match self.transport.read().as_ref() {
            Some(transport) => transport.produce(record),
            None => Delivery::Fallback,
        };
        if delivery == Delivery::Fallback {
            if let Err(e) = self.fallback.lock().deliver(0, record) {
                debug!("Direct write failed: {}", e);
            }
        }
    }

    /// Redirect a stream locally and, when connected, in the daemon.
    pub fn configure(&self, config: ConfigRecord) -> ShmResult<()> {
        let record = Record::Config(config);
        // Reject what cannot be forwarded before touching local state.
        record.encode()?;
        if let Record::Config(config) = &record {
            self.fallback.lock().apply(config)?;
        }
        if let Some(transport) = self.transport.read().as_ref() {
            if transport.produce(&record) == Delivery::Fallback {
                debug!("Stream configuration applied locally only");
            }
        }
        Ok(())
    }

    /// Choose the daemon executable; only before initialization.
    pub fn set_daemon_path(&self, path: impl Into<PathBuf>) -> ShmResult<()> {
        if self.is_initialized() {
            return Err(ShmError::AlreadyInitialized);
        }
        let path = path.into();
        if !path.is_file() {
            return Err(ShmError::NotFound {
                name: path.display().to_string(),
            });
        }
        self.config.lock().daemon_path = Some(path);
        Ok(())
    }

    /// Disconnect and restore the standard streams.
    pub fn shutdown(&self) {
        let _retry = self.init_lock.lock();
        if let Some(transport) = self.transport.write().take() {
            transport.disconnect();
        }
        self.initialized.store(false, Ordering::Release);
        let mut fallback = self.fallback.lock();
        if let Err(e) = fallback.flush().and_then(|()| fallback.reset()) {
            debug!("Restoring standard streams failed: {}", e);
        }
    }
}

impl Drop for LogService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
