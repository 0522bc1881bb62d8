//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across all sirius crates, plus the [`TransportConfig`] consumed by the
//! shared log transport and the daemon.
//!
//! # Usage
//!
//! ```rust,no_run
//! use sirius_common::config::{ConfigLoader, ConfigError, TransportConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = TransportConfig::load(Path::new("sirius.toml"))?;
//!     config.validate()?;
//!     println!("Segment key: {}", config.key);
//!     Ok(())
//! }
//! ```

use crate::consts::{
    BOOTSTRAP_INTERVAL_MS, BOOTSTRAP_RETRIES, CLAIM_TIMEOUT_MS, DEFAULT_LOG_KEY,
    DEFAULT_SHM_CAPACITY, HOUSEKEEPING_INTERVAL_MS, IDLE_EXIT_GRACE_MS, INIT_COOLDOWN_MS,
    MAX_SHM_CAPACITY, PROCESS_FEED_GUARD_MS, PROCESS_GUARD_TIMEOUT_MS, SHM_SLOT_RESET_TIMEOUT_MS,
    WATCHDOG_INTERVAL_MS, next_power_of_two,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Severity of a log record.
///
/// Uses lowercase serde values for TOML compatibility. The numeric form
/// returned by [`LogLevel::as_u8`] is the wire value stored in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Wire value of the level.
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Trace => 0,
            Self::Debug => 1,
            Self::Info => 2,
            Self::Warn => 3,
            Self::Error => 4,
        }
    }

    /// Parse a wire value, `None` for unknown levels.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Trace),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warn),
            4 => Some(Self::Error),
            _ => None,
        }
    }

    /// `Warn` and `Error` go to the error stream.
    pub const fn is_error_stream(self) -> bool {
        matches!(self, Self::Warn | Self::Error)
    }
}

/// Configuration of the shared-memory log transport.
///
/// Every field has a default, so an empty TOML file is a valid configuration.
///
/// # TOML Example
///
/// ```toml
/// key = "utils_log"
/// capacity = 512
/// lock_dir = "/run/user/1000"
/// spawn_daemon = true
/// heartbeat_interval_ms = 2000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Logical key of the segment; hashed into the shared object name.
    pub key: String,

    /// Number of ring slots, rounded up to a power of two.
    pub capacity: usize,

    /// Overrides the lock file directory candidates.
    pub lock_dir: Option<PathBuf>,

    /// Explicit daemon executable, highest lookup priority.
    pub daemon_path: Option<PathBuf>,

    /// Whether a native may spawn the daemon.
    pub spawn_daemon: bool,

    pub heartbeat_interval_ms: u64,
    pub process_guard_timeout_ms: u64,
    pub slot_reset_timeout_ms: u64,
    pub watchdog_interval_ms: u64,
    pub housekeeping_interval_ms: u64,
    pub claim_timeout_ms: u64,
    pub bootstrap_retries: u32,
    pub bootstrap_interval_ms: u64,
    pub init_cooldown_ms: u64,
    pub idle_exit_grace_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_LOG_KEY.to_string(),
            capacity: DEFAULT_SHM_CAPACITY,
            lock_dir: None,
            daemon_path: None,
            spawn_daemon: true,
            heartbeat_interval_ms: PROCESS_FEED_GUARD_MS,
            process_guard_timeout_ms: PROCESS_GUARD_TIMEOUT_MS,
            slot_reset_timeout_ms: SHM_SLOT_RESET_TIMEOUT_MS,
            watchdog_interval_ms: WATCHDOG_INTERVAL_MS,
            housekeeping_interval_ms: HOUSEKEEPING_INTERVAL_MS,
            claim_timeout_ms: CLAIM_TIMEOUT_MS,
            bootstrap_retries: BOOTSTRAP_RETRIES,
            bootstrap_interval_ms: BOOTSTRAP_INTERVAL_MS,
            init_cooldown_ms: INIT_COOLDOWN_MS,
            idle_exit_grace_ms: IDLE_EXIT_GRACE_MS,
        }
    }
}

impl TransportConfig {
    /// Default configuration for the given segment key.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Set the lock file directory.
    pub fn lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    /// Set the requested ring capacity.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Enable or disable spawning the daemon.
    pub fn spawn_daemon(mut self, spawn: bool) -> Self {
        self.spawn_daemon = spawn;
        self
    }

    /// Set the explicit daemon executable.
    pub fn daemon_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.daemon_path = Some(path.into());
        self
    }

    /// Capacity actually used by the segment.
    pub fn effective_capacity(&self) -> usize {
        next_power_of_two(self.capacity)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `key` is empty
    /// - `capacity` is zero or rounds above the maximum
    /// - any interval or timeout is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key.is_empty() {
            return Err(ConfigError::ValidationError(
                "key cannot be empty".to_string(),
            ));
        }
        if self.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if self.effective_capacity() > MAX_SHM_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "capacity {} exceeds maximum {}",
                self.capacity, MAX_SHM_CAPACITY
            )));
        }
        let intervals = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("process_guard_timeout_ms", self.process_guard_timeout_ms),
            ("slot_reset_timeout_ms", self.slot_reset_timeout_ms),
            ("watchdog_interval_ms", self.watchdog_interval_ms),
            ("housekeeping_interval_ms", self.housekeeping_interval_ms),
            ("claim_timeout_ms", self.claim_timeout_ms),
            ("bootstrap_interval_ms", self.bootstrap_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ValidationError(format!(
                "{name} must be greater than zero"
            )));
        }
        if self.bootstrap_retries == 0 {
            return Err(ConfigError::ValidationError(
                "bootstrap_retries must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn bootstrap_interval(&self) -> Duration {
        Duration::from_millis(self.bootstrap_interval_ms)
    }

    pub fn init_cooldown(&self) -> Duration {
        Duration::from_millis(self.init_cooldown_ms)
    }

    pub fn idle_exit_grace(&self) -> Duration {
        Duration::from_millis(self.idle_exit_grace_ms)
    }
}

/// Trait for loading configuration from TOML files.
///
/// This trait provides a default implementation that works with any type
/// implementing `serde::de::DeserializeOwned`.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_level_wire_values() {
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(LogLevel::from_u8(level.as_u8()), Some(level));
        }
        assert_eq!(LogLevel::from_u8(5), None);
        assert_eq!(LogLevel::from_u8(255), None);
    }

    #[test]
    fn test_log_level_stream_routing() {
        assert!(!LogLevel::Trace.is_error_stream());
        assert!(!LogLevel::Debug.is_error_stream());
        assert!(!LogLevel::Info.is_error_stream());
        assert!(LogLevel::Warn.is_error_stream());
        assert!(LogLevel::Error.is_error_stream());
    }

    #[test]
    fn test_log_level_deserialization() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct TestWrapper {
            level: LogLevel,
        }

        assert_eq!(
            toml::from_str::<TestWrapper>("level = \"warn\"")
                .unwrap()
                .level,
            LogLevel::Warn
        );
        assert!(toml::from_str::<TestWrapper>("level = \"loud\"").is_err());
    }

    #[test]
    fn test_transport_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.key, "utils_log");
        assert_eq!(config.capacity, 512);
        assert!(config.spawn_daemon);
        assert!(config.lock_dir.is_none());
        assert_eq!(config.heartbeat_interval_ms, 2_000);
        assert_eq!(config.slot_reset_timeout_ms, 10_000);
        assert_eq!(config.bootstrap_retries, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transport_config_capacity_rounding() {
        let config = TransportConfig::default().capacity(100);
        assert_eq!(config.effective_capacity(), 128);
        let config = TransportConfig::default().capacity(256);
        assert_eq!(config.effective_capacity(), 256);
    }

    #[test]
    fn test_transport_config_validation_errors() {
        let config = TransportConfig::with_key("");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let config = TransportConfig::default().capacity(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let config = TransportConfig::default().capacity(MAX_SHM_CAPACITY + 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = TransportConfig::default();
        config.watchdog_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("watchdog_interval_ms"));
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = TransportConfig::load(Path::new("/nonexistent/path/sirius.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = TransportConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_config_loader_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"key = "app_log"
capacity = 64
lock_dir = "/tmp/sirius-test"
spawn_daemon = false
claim_timeout_ms = 50
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = TransportConfig::load(file.path()).unwrap();
        assert_eq!(config.key, "app_log");
        assert_eq!(config.capacity, 64);
        assert_eq!(config.lock_dir, Some(PathBuf::from("/tmp/sirius-test")));
        assert!(!config.spawn_daemon);
        assert_eq!(config.claim_timeout(), Duration::from_millis(50));
        // Untouched fields keep their defaults.
        assert_eq!(config.watchdog_interval_ms, 1_000);
    }

    #[test]
    fn test_config_loader_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let config = TransportConfig::load(file.path()).unwrap();
        assert_eq!(config, TransportConfig::default());
    }
}
