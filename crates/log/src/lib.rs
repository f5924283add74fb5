//! Process-wide leveled logger. Lines go to stderr and, optionally, to an
//! append-only file, rendered either as text or as one JSON object per line.

use std::fmt::{self, Write as _};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let level = match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return None,
        };
        Some(level)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text,
    Json,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Format selected by the last `init`.
    pub fn current() -> Self {
        if JSON.load(Ordering::Relaxed) {
            Self::Json
        } else {
            Self::Text
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
    /// Lines are appended here in addition to stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
            file: None,
        }
    }
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static JSON: AtomicBool = AtomicBool::new(false);
static TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static FILE_SINK: Mutex<Option<BufWriter<File>>> = Mutex::new(None);

/// Keeps the file sink attached; dropping it flushes and detaches the file.
#[must_use = "dropping the guard flushes and detaches the log file"]
pub struct LogGuard {
    _private: (),
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        flush();
        if let Ok(mut sink) = FILE_SINK.lock() {
            sink.take();
        }
    }
}

pub fn init(config: LogConfig) -> io::Result<LogGuard> {
    if let Some(path) = config.file.as_ref() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Ok(mut sink) = FILE_SINK.lock() {
            *sink = Some(BufWriter::new(file));
        }
    }
    MAX_LEVEL.store(config.level as u8, Ordering::Relaxed);
    JSON.store(config.format == Format::Json, Ordering::Relaxed);
    TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
    Ok(LogGuard { _private: () })
}

pub fn flush() {
    let _ = io::stderr().flush();
    if let Ok(mut sink) = FILE_SINK.lock() {
        if let Some(writer) = sink.as_mut() {
            let _ = writer.flush();
        }
    }
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

/// One log call site's output before rendering.
pub struct Record<'a> {
    pub level: Level,
    pub target: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub args: fmt::Arguments<'a>,
}

impl Record<'_> {
    /// Renders the record as one line without a trailing newline. `now` is
    /// the time since the unix epoch; `None` omits the text timestamp.
    pub fn render(&self, format: Format, now: Option<Duration>) -> String {
        match format {
            Format::Text => {
                let mut out = String::new();
                if let Some(now) = now {
                    write_utc(&mut out, now);
                    out.push(' ');
                }
                let _ = write!(out, "{} {}: {}", self.level.as_str(), self.target, self.args);
                out
            }
            Format::Json => {
                let ts_ms = now.map(|now| u64::try_from(now.as_millis()).unwrap_or(u64::MAX));
                json!({
                    "ts_ms": ts_ms,
                    "level": self.level.as_str(),
                    "target": self.target,
                    "file": self.file,
                    "line": self.line,
                    "msg": self.args.to_string(),
                })
                .to_string()
            }
        }
    }
}

pub fn log(record: &Record<'_>) {
    if !enabled(record.level) {
        return;
    }
    let format = Format::current();
    // JSON lines always carry a timestamp.
    let now = (format == Format::Json || TIMESTAMPS.load(Ordering::Relaxed)).then(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    });
    let line = record.render(format, now);

    let _ = writeln!(io::stderr().lock(), "{line}");
    if let Ok(mut sink) = FILE_SINK.lock() {
        if let Some(writer) = sink.as_mut() {
            let _ = writeln!(writer, "{line}");
            if record.level == Level::Error {
                let _ = writer.flush();
            }
        }
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::enabled(level) {
            $crate::log(&$crate::Record {
                level,
                target: module_path!(),
                file: file!(),
                line: line!(),
                args: format_args!($($arg)*),
            });
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Error, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Info, $($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Trace, $($arg)*) };
}

/// Appends `since_epoch` as an RFC 3339 UTC timestamp with milliseconds.
fn write_utc(out: &mut String, since_epoch: Duration) {
    let secs = since_epoch.as_secs();
    let (year, month, day) = civil_date(secs / 86_400);
    let secs_of_day = secs % 86_400;
    let _ = write!(
        out,
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        secs_of_day / 3_600,
        secs_of_day % 3_600 / 60,
        secs_of_day % 60,
        since_epoch.subsec_millis()
    );
}

/// Proleptic Gregorian date of a day count since 1970-01-01.
fn civil_date(days: u64) -> (u64, u64, u64) {
    // Shift the epoch to 0000-03-01 so leap days fall at the end of a year.
    let shifted = days + 719_468;
    let era = shifted / 146_097;
    let day_of_era = shifted % 146_097;
    let year_of_era =
        (day_of_era - day_of_era / 1_460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_index = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * month_index + 2) / 5 + 1;
    let month = if month_index < 10 {
        month_index + 3
    } else {
        month_index - 9
    };
    let year = year_of_era + era * 400 + u64::from(month <= 2);
    (year, month, day)
}
