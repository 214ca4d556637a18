//! Leveled, categorized event sink
//!
//! The jail engine never logs through global state. Callers hand an
//! `Arc<dyn LogSink>` to the registry, which passes it to every jail.

use env_logger::{Builder, Env, Target};
use log::Level;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

/// File written under the configured log directory
pub const LOG_FILE: &str = "agi.log";

/// Destination for engine log events
pub trait LogSink: Send + Sync {
    /// Record one event
    fn record(&self, level: Level, category: &str, message: &str);

    fn debug(&self, category: &str, message: &str) {
        self.record(Level::Debug, category, message);
    }

    fn info(&self, category: &str, message: &str) {
        self.record(Level::Info, category, message);
    }

    fn warning(&self, category: &str, message: &str) {
        self.record(Level::Warn, category, message);
    }

    fn error(&self, category: &str, message: &str) {
        self.record(Level::Error, category, message);
    }
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn record(&self, _level: Level, _category: &str, _message: &str) {}
}

/// Sink that forwards to the `log` facade with target `agi::<category>`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFacade;

impl LogSink for LogFacade {
    fn record(&self, level: Level, category: &str, message: &str) {
        let target = format!("agi::{}", category);
        log::log!(target: target.as_str(), level, "{}", message);
    }
}

/// A captured event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub level: Level,
    pub category: String,
    pub message: String,
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events recorded so far
    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Events at exactly `level`
    pub fn at(&self, level: Level) -> Vec<LogEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level)
            .collect()
    }

    /// True if any event message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn record(&self, level: Level, category: &str, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(LogEvent {
                level,
                category: category.to_string(),
                message: message.to_string(),
            });
    }
}

/// Initialize the process logger for the `agi` binary
///
/// `RUST_LOG` takes precedence; otherwise `level`, or `debug` when verbose.
/// With a log directory, every line also goes to [`LOG_FILE`] inside it.
/// An unwritable directory leaves logging on stderr only.
pub fn init(verbose: bool, level: &str, log_dir: Option<&Path>) {
    let default = if verbose { "debug" } else { level };
    let env = Env::default().filter_or("RUST_LOG", default);

    let mut builder = Builder::from_env(env);
    builder.format(|buf, record| {
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let category = record.target().strip_prefix("agi::").unwrap_or(record.target());
        writeln!(buf, "{} [{}] {}", level, category, record.args())
    });

    let mut unwritable = None;
    if let Some(dir) = log_dir {
        match open_log_file(dir) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(Tee { file })));
            }
            Err(e) => unwritable = Some((dir, e)),
        }
    }
    builder.init();

    if let Some((dir, e)) = unwritable {
        log::debug!(target: "agi::logging", "Not logging to {}: {}", dir.display(), e);
    }
}

/// Open `<dir>/agi.log` for appending, creating the directory if needed
pub fn open_log_file(dir: &Path) -> io::Result<File> {
    fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))
}

/// Copies every log line to stderr and the log file
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}
