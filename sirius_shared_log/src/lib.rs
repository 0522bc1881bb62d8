//! # Sirius Shared Log
//!
//! Cross-process log transport over a POSIX shared memory ring. Any number of
//! native processes produce records into fixed-size slots; a single daemon
//! drains them in global write order and writes them to stdout/stderr or to
//! configured files.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────────┐    ┌─────────────────┐
//! │   Native 1..N   │    │   Shared Segment     │    │     Daemon      │
//! │                 │    │                      │    │                 │
//! │ NativeTransport ├───►│ [Header|Slot ring]   ├───►│ DrainWorker     │
//! │ LogService      │    │ write/read indices   │    │ Watchdog        │
//! └─────────────────┘    │ attachment table     │    │ Guard           │
//!         │              └──────────────────────┘    └────────┬────────┘
//!         │ no daemon                                         │
//!         ▼                                                    ▼
//!    own stdout/stderr                                    FdSink
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sirius::config::{LogLevel, TransportConfig};
//! use sirius_shared_log::LogService;
//!
//! let service = LogService::new(TransportConfig::default());
//! service.write(LogLevel::Info, "engine started\n");
//! service.shutdown();
//! ```
//!
//! ## Slot Protocol
//!
//! Each ring slot carries a `turn` counter. A producer that claimed write
//! index `i` may only fill slot `i % capacity` once its turn equals `i`; the
//! daemon hands the slot to `i + capacity` when it frees it. Slot states move
//! `Free → Writing → Ready → Free`, with `Recovering` used by the watchdog and
//! by the daemon when it skips an index that was never written.

#![warn(clippy::all)]

pub mod attachment;
pub mod bootstrap;
pub mod consumer;
pub mod error;
pub mod layout;
pub mod mutex;
pub mod platform;
pub mod producer;
pub mod record;
pub mod segment;
pub mod service;
pub mod sink;

pub use attachment::{Attachment, AttachmentTable};
pub use consumer::{Daemon, DaemonHandle, DaemonReport, DaemonState, RECOVERED_SLOT_TEXT};
pub use error::{ShmError, ShmResult};
pub use layout::{Role, SlotState, SLOT_PAYLOAD_SIZE, SLOT_SIZE};
pub use mutex::{CrossProcessMutex, FileMutex, LockGuard, LockState};
pub use producer::{Delivery, NativeTransport};
pub use record::{ConfigRecord, LogRecord, Record, Stream};
pub use segment::{SegmentSnapshot, SharedSegment};
pub use service::LogService;
pub use sink::{FdSink, FileMode, RecordSink};

/// Initialize tracing for diagnostics of the transport itself
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
