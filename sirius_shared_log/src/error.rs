//! Error types for the shared log transport

use sirius::config::ConfigError;
use thiserror::Error;

/// Errors that can occur in the shared log transport
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment, lock file or executable not found
    #[error("Not found: {name}")]
    NotFound {
        /// Name or path that was looked up
        name: String,
    },

    /// Size does not fit the layout or a record limit
    #[error("Invalid size: {size} bytes (expected {expected})")]
    InvalidSize {
        /// Actual size in bytes
        size: usize,
        /// Size required by the layout, or the limit exceeded
        expected: usize,
    },

    /// Header stamp or layout does not match this build
    #[error("Invalid header in {name}: {reason}")]
    InvalidHeader {
        /// Segment name
        name: String,
        /// What failed validation
        reason: String,
    },

    /// Attachment table has no free entry
    #[error("Attachment table full ({max} entries)")]
    TableFull {
        /// Table size
        max: usize,
    },

    /// Another live daemon owns the segment
    #[error("Daemon already running: pid {pid}")]
    DaemonAlreadyRunning {
        /// Pid of the registered daemon
        pid: u32,
    },

    /// No daemon became ready within the bootstrap budget
    #[error("Daemon unavailable: {reason}")]
    DaemonUnavailable {
        /// Why the daemon is unavailable
        reason: String,
    },

    /// Cross-process lock could not be taken or released
    #[error("Lock failure on {name}: {reason}")]
    Lock {
        /// Lock name or path
        name: String,
        /// Failure detail
        reason: String,
    },

    /// Slot payload could not be decoded
    #[error("Record decode failure: {reason}")]
    Decode {
        /// Failure detail
        reason: String,
    },

    /// Operation only allowed before initialization
    #[error("Log service already initialized")]
    AlreadyInitialized,

    /// Invalid transport configuration
    #[error("Configuration error: {source}")]
    Config {
        /// Source configuration error
        #[from]
        source: ConfigError,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// JSON serialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },

    /// TOML serialization error
    #[error("TOML error: {source}")]
    Toml {
        /// Source TOML error
        #[from]
        source: toml::ser::Error,
    },
}

impl ShmError {
    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_header(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidHeader {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for shared log operations
pub type ShmResult<T> = Result<T, ShmError>;
