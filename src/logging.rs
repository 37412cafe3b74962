//! A minimal logger: a background thread receives log records over an
//! `mpsc` channel and writes them to a file (or stdout), so logging from
//! inside the monitor mutex never blocks on I/O.
//!
//! Adapted from the async, tokio-channel logger this crate's ambient stack is
//! otherwise grounded on — `fairlock` has no async runtime of its own, so the
//! channel and the writer thread are both plain `std`.

use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::sync::{LazyLock, OnceLock};
use std::thread::JoinHandle;

pub(crate) static LOGGER_CELL: OnceLock<Logger> = OnceLock::new();

/// Enables `debug`-level log lines. Read once from `FAIRLOCK_DEBUG` at first
/// use; set the environment variable before the first log call to take
/// effect.
pub(crate) static DEBUG_MODE: LazyLock<bool> = LazyLock::new(|| {
    std::env::var("FAIRLOCK_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "\x1b[36mTRACE\x1b[0m",
            LogLevel::Debug => "\x1b[34mDEBUG\x1b[0m",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "\x1b[33mWARN \x1b[0m",
            LogLevel::Error => "\x1b[31mERROR\x1b[0m",
        };
        write!(f, "{}", s)
    }
}

/// A logger handle. Cloning shares the same background writer thread.
#[derive(Clone)]
pub struct Logger {
    tx: mpsc::Sender<LogRecord>,
}

impl Logger {
    fn log<S: Into<String>>(&self, level: LogLevel, msg: S) {
        let _ = self.tx.send(LogRecord::Message {
            level,
            msg: msg.into(),
            ts_millis: Utc::now().timestamp_millis(),
        });
    }

    /// Ask the writer thread to flush and exit. Further calls on this handle
    /// (or clones of it) are silently dropped once the thread has stopped.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LogRecord::Shutdown);
    }

    pub fn trace<S: Into<String>>(&self, msg: S) {
        self.log(LogLevel::Trace, msg);
    }

    pub fn debug<S: Into<String>>(&self, msg: S) {
        if *DEBUG_MODE {
            self.log(LogLevel::Debug, msg);
        }
    }

    pub fn info<S: Into<String>>(&self, msg: S) {
        self.log(LogLevel::Info, msg);
    }

    pub fn warn<S: Into<String>>(&self, msg: S) {
        self.log(LogLevel::Warn, msg);
    }

    pub fn error<S: Into<String>>(&self, msg: S) {
        self.log(LogLevel::Error, msg);
    }
}

enum LogRecord {
    Message {
        level: LogLevel,
        msg: String,
        ts_millis: i64,
    },
    Shutdown,
}

impl LogRecord {
    fn format_line(&self) -> Option<String> {
        match self {
            LogRecord::Message { level, msg, ts_millis } => {
                let dt = DateTime::from_timestamp_millis(*ts_millis).unwrap_or_else(Utc::now);
                let timestamp = dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
                Some(format!("{timestamp} [{level}] {msg}\n"))
            }
            LogRecord::Shutdown => None,
        }
    }
}

/// Spawn a logger writing to `path` (created if missing, appended if it
/// already exists). Returns the handle and the writer thread's join handle;
/// the thread exits once every `Logger` clone has been dropped or
/// [`Logger::shutdown`] has been called.
pub fn init_file_logger<P: AsRef<Path>>(path: P) -> std::io::Result<(Logger, JoinHandle<()>)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    let (tx, rx) = mpsc::channel::<LogRecord>();

    let handle = std::thread::Builder::new()
        .name("fairlock-logger".to_string())
        .spawn(move || {
            while let Ok(record) = rx.recv() {
                match &record {
                    LogRecord::Message { .. } => {
                        if let Some(line) = record.format_line() {
                            let _ = writer.write_all(line.as_bytes());
                            let _ = writer.flush();
                        }
                    }
                    LogRecord::Shutdown => break,
                }
            }
            let _ = writer.flush();
        })
        .expect("failed to spawn logger thread");

    Ok((Logger { tx }, handle))
}

fn stdout_logger() -> Logger {
    let (tx, rx) = mpsc::channel::<LogRecord>();
    std::thread::Builder::new()
        .name("fairlock-logger".to_string())
        .spawn(move || {
            let stdout = std::io::stdout();
            while let Ok(record) = rx.recv() {
                match &record {
                    LogRecord::Message { .. } => {
                        if let Some(line) = record.format_line() {
                            let mut handle = stdout.lock();
                            let _ = handle.write_all(line.as_bytes());
                        }
                    }
                    LogRecord::Shutdown => break,
                }
            }
        })
        .expect("failed to spawn logger thread");
    Logger { tx }
}

/// Install the process-wide default logger (stdout-backed). A no-op if a
/// logger has already been installed — the first caller wins, matching
/// [`crate::global`]'s singleton discipline.
pub fn init_default_logger() {
    let _ = LOGGER_CELL.set(stdout_logger());
}

/// The process-wide logger, installing the stdout-backed default on first
/// use if nothing else has installed one yet.
pub(crate) fn logger() -> &'static Logger {
    if LOGGER_CELL.get().is_none() {
        init_default_logger();
    }
    LOGGER_CELL.get().expect("LOGGER_CELL is set by init_default_logger above")
}
