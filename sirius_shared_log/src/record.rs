//! Records carried by ring slots
//!
//! Wire format (all slots, little-endian):
//!
//! | kind | body                                         |
//! |------|----------------------------------------------|
//! | 1    | level: u8, text bytes                        |
//! | 2    | stream: u8, has_path: u8, path bytes (UTF-8) |
//!
//! The kind byte is always checked before the body is interpreted.

use crate::error::{ShmError, ShmResult};
use crate::layout::SLOT_PAYLOAD_SIZE;
use sirius::config::LogLevel;
use std::borrow::Cow;
use tracing::debug;

const KIND_LOG: u8 = 1;
const KIND_CONFIG: u8 = 2;

/// Appended to a log text that did not fit into one slot.
pub const TRUNCATION_MARKER: &[u8] = b" [truncated]\n";

/// Longest log text stored in one slot.
pub const MAX_TEXT_LEN: usize = SLOT_PAYLOAD_SIZE - 2;

/// Longest path a config record can carry.
pub const MAX_PATH_LEN: usize = SLOT_PAYLOAD_SIZE - 3;

/// Output stream of the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Out,
    Err,
}

impl Stream {
    /// Stream a record of `level` is routed to.
    pub fn for_level(level: LogLevel) -> Self {
        if level.is_error_stream() {
            Self::Err
        } else {
            Self::Out
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Out => 0,
            Self::Err => 1,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Out),
            1 => Some(Self::Err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub text: Vec<u8>,
}

/// Redirect a stream to a file, or back to its standard descriptor when
/// `path` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRecord {
    pub stream: Stream,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Log(LogRecord),
    Config(ConfigRecord),
}

impl LogRecord {
    pub fn new(level: LogLevel, text: impl Into<Vec<u8>>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }

    /// Text as stored in a slot, truncated with a marker if needed.
    pub fn stored_text(&self) -> Cow<'_, [u8]> {
        truncate_text(&self.text)
    }
}

fn truncate_text(text: &[u8]) -> Cow<'_, [u8]> {
    if text.len() <= MAX_TEXT_LEN {
        return Cow::Borrowed(text);
    }
    debug!(
        "Log text of {} bytes truncated to {}",
        text.len(),
        MAX_TEXT_LEN
    );
    let keep = MAX_TEXT_LEN - TRUNCATION_MARKER.len();
    let mut out = Vec::with_capacity(MAX_TEXT_LEN);
    out.extend_from_slice(&text[..keep]);
    out.extend_from_slice(TRUNCATION_MARKER);
    Cow::Owned(out)
}

impl Record {
    pub fn log(level: LogLevel, text: impl Into<Vec<u8>>) -> Self {
        Self::Log(LogRecord::new(level, text))
    }

    pub fn config(stream: Stream, path: Option<String>) -> Self {
        Self::Config(ConfigRecord { stream, path })
    }

    /// Serialize into at most [`SLOT_PAYLOAD_SIZE`] bytes.
    ///
    /// Log text is truncated; an over-long config path is an error.
    pub fn encode(&self) -> ShmResult<Vec<u8>> {
        match self {
            Self::Log(log) => {
                let text = log.stored_text();
                let mut out = Vec::with_capacity(2 + text.len());
                out.push(KIND_LOG);
                out.push(log.level.as_u8());
                out.extend_from_slice(&text);
                Ok(out)
            }
            Self::Config(config) => {
                let path = config.path.as_deref().unwrap_or_default();
                if path.len() > MAX_PATH_LEN {
                    return Err(ShmError::InvalidSize {
                        size: path.len(),
                        expected: MAX_PATH_LEN,
                    });
                }
                let mut out = Vec::with_capacity(3 + path.len());
                out.push(KIND_CONFIG);
                out.push(config.stream.as_u8());
                out.push(u8::from(config.path.is_some()));
                out.extend_from_slice(path.as_bytes());
                Ok(out)
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> ShmResult<Self> {
        let (&kind, body) = bytes
            .split_first()
            .ok_or_else(|| ShmError::decode("empty payload"))?;
        match kind {
            KIND_LOG => {
                let (&level, text) = body
                    .split_first()
                    .ok_or_else(|| ShmError::decode("log record without level"))?;
                let level = LogLevel::from_u8(level)
                    .ok_or_else(|| ShmError::decode(format!("unknown level {level}")))?;
                Ok(Self::log(level, text.to_vec()))
            }
            KIND_CONFIG => {
                let [stream, has_path, path @ ..] = body else {
                    return Err(ShmError::decode("truncated config record"));
                };
                let stream = Stream::from_u8(*stream)
                    .ok_or_else(|| ShmError::decode(format!("unknown stream {stream}")))?;
                let path = match *has_path {
                    0 if path.is_empty() => None,
                    1 => Some(
                        String::from_utf8(path.to_vec())
                            .map_err(|_| ShmError::decode("config path is not UTF-8"))?,
                    ),
                    _ => return Err(ShmError::decode("malformed config path")),
                };
                Ok(Self::config(stream, path))
            }
            other => Err(ShmError::decode(format!("unknown record kind {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_log_record_layout() {
        let bytes = Record::log(LogLevel::Warn, "disk full\n").encode().unwrap();
        assert_eq!(bytes[0], KIND_LOG);
        assert_eq!(bytes[1], LogLevel::Warn.as_u8());
        assert_eq!(&bytes[2..], b"disk full\n");
    }

    #[test]
    fn test_config_record_restore_default() {
        let record = Record::config(Stream::Err, None);
        let bytes = record.encode().unwrap();
        assert_eq!(bytes, vec![KIND_CONFIG, 1, 0]);
        assert_eq!(Record::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let err = Record::decode(&[9, 0, 1]).unwrap_err();
        assert!(matches!(err, ShmError::Decode { .. }));
        assert!(Record::decode(&[]).is_err());
        assert!(Record::decode(&[KIND_LOG]).is_err());
        assert!(Record::decode(&[KIND_LOG, 42, b'x']).is_err());
        assert!(Record::decode(&[KIND_CONFIG, 0]).is_err());
        assert!(Record::decode(&[KIND_CONFIG, 3, 0]).is_err());
        assert!(Record::decode(&[KIND_CONFIG, 0, 0, b'x']).is_err());
    }

    #[test]
    fn test_overflow_is_truncated_with_marker() {
        let text = vec![b'a'; MAX_TEXT_LEN + 100];
        let bytes = Record::log(LogLevel::Info, text).encode().unwrap();
        assert_eq!(bytes.len(), SLOT_PAYLOAD_SIZE);
        assert!(bytes.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_overlong_path_rejected() {
        let path = "p".repeat(MAX_PATH_LEN + 1);
        let result = Record::config(Stream::Out, Some(path)).encode();
        assert!(matches!(result, Err(ShmError::InvalidSize { .. })));
    }

    #[test]
    fn test_stream_routing() {
        assert_eq!(Stream::for_level(LogLevel::Info), Stream::Out);
        assert_eq!(Stream::for_level(LogLevel::Error), Stream::Err);
    }

    proptest! {
        #[test]
        fn prop_encoded_log_fits_a_slot(len in 0usize..3 * SLOT_PAYLOAD_SIZE, level in 0u8..5) {
            let level = LogLevel::from_u8(level).unwrap();
            let text = vec![b'x'; len];
            let bytes = Record::log(level, text.clone()).encode().unwrap();
            prop_assert!(bytes.len() <= SLOT_PAYLOAD_SIZE);

            let Record::Log(decoded) = Record::decode(&bytes).unwrap() else {
                panic!("expected a log record");
            };
            prop_assert_eq!(decoded.level, level);
            if len <= MAX_TEXT_LEN {
                prop_assert_eq!(decoded.text, text);
            } else {
                prop_assert!(decoded.text.ends_with(TRUNCATION_MARKER));
                prop_assert_eq!(decoded.text.len(), MAX_TEXT_LEN);
            }
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Record::decode(&bytes);
        }
    }
}
