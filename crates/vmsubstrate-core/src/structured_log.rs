//! Structured logging for the substrate.
//!
//! Every diagnostic the substrate produces is a single JSONL record:
//! - [`LogEntry`]: canonical record with required + optional fields.
//! - [`LogEmitter`]: writes JSONL lines to stderr, a file, or a shared buffer.
//! - [`log`], [`report`], [`trace`]: process-wide emission gated by [`crate::config`].
//!
//! Required fields are `timestamp`, `trace_id`, `level` and `event`. Trace ids follow
//! `<run_id>::<seq>`.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{TraceChannel, config};

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Parse from string (case-insensitive). Unknown values map to `Info`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "all" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "fatal" | "off" => Self::Fatal,
            _ => Self::Info,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

/// Canonical structured log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    /// Emitting subsystem (`threads`, `condition`, `tele`, `image`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    /// Native handle of the thread the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    /// Human readable rendering of `errno`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            subsystem: None,
            thread: None,
            errno: None,
            os_error: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = Some(subsystem.into());
        self
    }

    #[must_use]
    pub fn with_thread(mut self, thread: u64) -> Self {
        self.thread = Some(thread);
        self
    }

    /// Set errno and its OS rendering.
    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self.os_error = Some(crate::error::errno_text(errno));
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// In-memory sink whose contents stay readable after being handed to an emitter.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes structured JSONL log entries.
pub struct LogEmitter {
    writer: Box<dyn Write + Send>,
    seq: u64,
    run_id: String,
}

impl LogEmitter {
    /// Create an emitter that writes to stderr.
    #[must_use]
    pub fn to_stderr(run_id: &str) -> Self {
        Self::to_writer(Box::new(io::stderr()), run_id)
    }

    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, run_id: &str) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::to_writer(Box::new(BufWriter::new(file)), run_id))
    }

    /// Create an emitter over an arbitrary writer.
    #[must_use]
    pub fn to_writer(writer: Box<dyn Write + Send>, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            run_id: run_id.to_string(),
        }
    }

    /// Create an emitter writing into a [`SharedBuffer`] (for tests and tooling).
    #[must_use]
    pub fn to_shared_buffer(run_id: &str) -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::default();
        (Self::to_writer(Box::new(buffer.clone()), run_id), buffer)
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{:06}", self.run_id, self.seq)
    }

    /// Emit a log entry with an auto-generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> io::Result<LogEntry> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(trace_id, level, event);
        let line = serde_json::to_string(&entry).map_err(io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        Ok(entry)
    }

    /// Emit a fully-populated log entry, filling in the trace id if empty.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        let line = serde_json::to_string(&entry).map_err(io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

// ---------------------------------------------------------------------------
// Process-wide emission
// ---------------------------------------------------------------------------

fn global() -> &'static Mutex<LogEmitter> {
    static EMITTER: OnceLock<Mutex<LogEmitter>> = OnceLock::new();
    EMITTER.get_or_init(|| {
        let run_id = format!("vmsubstrate-{}", std::process::id());
        Mutex::new(LogEmitter::to_stderr(&run_id))
    })
}

/// Replace the process-wide emitter, flushing and returning the previous one.
pub fn install_emitter(emitter: LogEmitter) -> LogEmitter {
    let mut slot = global().lock();
    let mut previous = std::mem::replace(&mut *slot, emitter);
    let _ = previous.flush();
    previous
}

/// Flush the process-wide emitter.
pub fn flush() -> io::Result<()> {
    global().lock().flush()
}

/// Returns true if entries at `level` pass the configured threshold.
#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level >= config().log_level
}

/// Emit `entry` if its level passes the configured threshold.
pub fn log(entry: LogEntry) {
    if enabled(entry.level) {
        write_entry(entry);
    }
}

fn write_entry(entry: LogEntry) {
    let fatal = entry.level == LogLevel::Fatal;
    let mut emitter = global().lock();
    // Logging must never take the substrate down; write errors are dropped.
    let _ = emitter.emit_entry(entry);
    if fatal {
        let _ = emitter.flush();
    }
}

/// Emit a subsystem event with optional errno and details.
pub fn report(
    level: LogLevel,
    subsystem: &str,
    event: &str,
    errno: Option<i32>,
    details: Option<serde_json::Value>,
) {
    if !enabled(level) {
        return;
    }
    let mut entry = LogEntry::new(String::new(), level, event).with_subsystem(subsystem);
    if let Some(errno) = errno {
        entry = entry.with_errno(errno);
    }
    if let Some(details) = details {
        entry = entry.with_details(details);
    }
    write_entry(entry);
}

/// Emit a channel trace line if `channel` is enabled.
///
/// `details` is only evaluated when the channel is on.
pub fn trace<F>(channel: TraceChannel, event: &str, details: F)
where
    F: FnOnce() -> serde_json::Value,
{
    if !config().traces(channel) {
        return;
    }
    let entry = LogEntry::new(String::new(), LogLevel::Trace, event)
        .with_subsystem(channel.name())
        .with_details(details());
    write_entry(entry);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

/// Render seconds since the epoch as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
fn format_utc(secs: u64, millis: u32) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}

/// Proleptic Gregorian date for a day count relative to 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
