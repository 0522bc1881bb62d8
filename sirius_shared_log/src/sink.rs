//! Record sinks: where drained or fallback records end up

use crate::record::{ConfigRecord, LogRecord, Record, Stream};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Destination of delivered records.
pub trait RecordSink: Send {
    /// Handle one record; `sequence` is its write index (0 for fallback).
    fn deliver(&mut self, sequence: u64, record: &Record) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// How `ConfigRecord` paths are opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Create and truncate, used by the daemon that owns the output.
    Truncate,
    /// Create and append, used by natives writing next to the daemon.
    Append,
}

enum Target {
    Std,
    File(File),
}

/// Writes log text to stdout/stderr or to files selected by config records.
pub struct FdSink {
    out: Target,
    err: Target,
    mode: FileMode,
}

impl FdSink {
    pub fn new(mode: FileMode) -> Self {
        Self {
            out: Target::Std,
            err: Target::Std,
            mode,
        }
    }

    fn target_mut(&mut self, stream: Stream) -> &mut Target {
        match stream {
            Stream::Out => &mut self.out,
            Stream::Err => &mut self.err,
        }
    }

    fn open(&self, path: &Path) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.create(true);
        match self.mode {
            FileMode::Truncate => options.write(true).truncate(true),
            FileMode::Append => options.append(true),
        };
        options.open(path)
    }

    /// Redirect or restore a stream. On open failure the stream is unchanged.
    pub fn apply(&mut self, config: &ConfigRecord) -> io::Result<()> {
        let target = match &config.path {
            Some(path) => {
                let file = self.open(Path::new(path)).inspect_err(|e| {
                    warn!("Cannot open log file {}: {}", path, e);
                })?;
                debug!("{:?} stream redirected to {}", config.stream, path);
                Target::File(file)
            }
            None => {
                debug!("{:?} stream restored", config.stream);
                Target::Std
            }
        };
        let slot = self.target_mut(config.stream);
        flush_target(slot)?;
        *slot = target;
        Ok(())
    }

    /// Restore both standard streams.
    pub fn reset(&mut self) -> io::Result<()> {
        self.apply(&ConfigRecord {
            stream: Stream::Out,
            path: None,
        })?;
        self.apply(&ConfigRecord {
            stream: Stream::Err,
            path: None,
        })
    }

    pub fn write_log(&mut self, record: &LogRecord) -> io::Result<()> {
        let text = record.stored_text();
        match self.target_mut(Stream::for_level(record.level)) {
            Target::File(file) => file.write_all(&text),
            Target::Std => match Stream::for_level(record.level) {
                Stream::Out => io::stdout().lock().write_all(&text),
                Stream::Err => io::stderr().lock().write_all(&text),
            },
        }
    }
}

fn flush_target(target: &mut Target) -> io::Result<()> {
    match target {
        Target::File(file) => file.flush(),
        Target::Std => Ok(()),
    }
}

impl RecordSink for FdSink {
    fn deliver(&mut self, _sequence: u64, record: &Record) -> io::Result<()> {
        match record {
            Record::Log(log) => self.write_log(log),
            Record::Config(config) => self.apply(config),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        flush_target(&mut self.out)?;
        flush_target(&mut self.err)?;
        io::stdout().flush()?;
        io::stderr().flush()
    }
}
