//! Process-wide logging and metrics, modeled on the teacher's `logger` crate:
//! a lazily-initialized global `Logger` and `Metrics` registry, each driven
//! through macros so call sites never touch a lock directly.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::Local;
use lazy_static::lazy_static;
use serde_derive::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
pub enum LoggerError {
    NeverInitialized(String),
    OpenLogFile(std::io::Error),
    Write(std::io::Error),
}

impl fmt::Display for LoggerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoggerError::NeverInitialized(s) => write!(f, "{}", s),
            LoggerError::OpenLogFile(e) => write!(f, "failed to open log file: {}", e),
            LoggerError::Write(e) => write!(f, "failed to write log line: {}", e),
        }
    }
}

/// Where a destination state.
enum Dest {
    Stdout,
    File(File),
}

pub struct Logger {
    level: Mutex<Level>,
    instance_id: Mutex<String>,
    dest: Mutex<Dest>,
    include_level: Mutex<bool>,
    include_origin: Mutex<bool>,
}

impl Logger {
    const fn new() -> Self {
        Logger {
            level: Mutex::new(Level::Warn),
            instance_id: Mutex::new(String::new()),
            dest: Mutex::new(Dest::Stdout),
            include_level: Mutex::new(true),
            include_origin: Mutex::new(false),
        }
    }

    /// Opens (or truncates) the log file. `append` mirrors spec §4.5 step 5:
    /// system-mode daemons append across restarts, session-mode truncates.
    pub fn init(
        &self,
        instance_id: &str,
        log_path: Option<String>,
        append: bool,
    ) -> Result<(), LoggerError> {
        *self.instance_id.lock().unwrap() = instance_id.to_string();
        if let Some(path) = log_path {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&path)
                .map_err(LoggerError::OpenLogFile)?;
            *self.dest.lock().unwrap() = Dest::File(file);
        }
        Ok(())
    }

    pub fn set_level(&self, level: Level) {
        *self.level.lock().unwrap() = level;
    }

    pub fn set_include_level(&self, v: bool) {
        *self.include_level.lock().unwrap() = v;
    }

    pub fn set_include_origin(&self, v: bool) {
        *self.include_origin.lock().unwrap() = v;
    }

    fn enabled(&self, level: Level) -> bool {
        level <= *self.level.lock().unwrap()
    }

    #[doc(hidden)]
    pub fn log(&self, level: Level, origin: &str, args: fmt::Arguments) {
        if !self.enabled(level) {
            return;
        }
        let ts = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
        let instance_id = self.instance_id.lock().unwrap();
        let mut line = format!("{} [{}", ts, instance_id);
        if *self.include_level.lock().unwrap() {
            line.push_str(&format!(":{}", level));
        }
        if *self.include_origin.lock().unwrap() {
            line.push_str(&format!(":{}", origin));
        }
        line.push_str(&format!("] {}\n", args));

        match &mut *self.dest.lock().unwrap() {
            Dest::Stdout => {
                let _ = std::io::stdout().write_all(line.as_bytes());
            }
            Dest::File(f) => {
                // Log-write failures are always non-fatal (spec §7).
                let _ = f.write_all(line.as_bytes());
            }
        }
    }

    pub fn log_metrics(&self) -> Result<(), LoggerError> {
        let serialized = serde_json::to_string(&*METRICS).map_err(|e| {
            LoggerError::Write(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        match &mut *self.dest.lock().unwrap() {
            Dest::Stdout => {
                let _ = writeln!(std::io::stdout(), "{}", serialized);
            }
            Dest::File(f) => {
                writeln!(f, "{}", serialized).map_err(LoggerError::Write)?;
            }
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref LOGGER: Logger = Logger::new();
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::LOGGER.log($crate::Level::Error, concat!(file!(), ":", line!()), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::LOGGER.log($crate::Level::Warn, concat!(file!(), ":", line!()), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::LOGGER.log($crate::Level::Info, concat!(file!(), ":", line!()), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::LOGGER.log($crate::Level::Debug, concat!(file!(), ":", line!()), format_args!($($arg)*))
    };
}

pub trait Metric {
    fn inc(&self);
    fn add(&self, n: usize);
    fn count(&self) -> usize;
}

#[derive(Default, Serialize)]
pub struct SharedMetric(AtomicUsize);

impl Metric for SharedMetric {
    fn inc(&self) {
        self.add(1);
    }
    fn add(&self, n: usize) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    fn count(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default, Serialize)]
pub struct MonitorMetrics {
    pub commands_sent: SharedMetric,
    pub commands_failed: SharedMetric,
    pub echo_bytes_stripped: SharedMetric,
}

#[derive(Default, Serialize)]
pub struct ReactorMetrics {
    pub wakeups: SharedMetric,
    pub child_exits: SharedMetric,
    pub poll_failures: SharedMetric,
}

#[derive(Default, Serialize)]
pub struct LifecycleMetrics {
    pub starts: SharedMetric,
    pub start_failures: SharedMetric,
    pub shutdowns: SharedMetric,
    pub saves: SharedMetric,
    pub restores: SharedMetric,
    pub migrations_out: SharedMetric,
    pub migrations_in: SharedMetric,
    pub panic_count: SharedMetric,
}

#[derive(Default, Serialize)]
pub struct Metrics {
    pub monitor: MonitorMetrics,
    pub reactor: ReactorMetrics,
    pub lifecycle: LifecycleMetrics,
}

lazy_static! {
    pub static ref METRICS: Metrics = Metrics::default();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_levels_filter() {
        let logger = Logger::new();
        logger.set_level(Level::Warn);
        assert!(logger.enabled(Level::Error));
        assert!(logger.enabled(Level::Warn));
        assert!(!logger.enabled(Level::Info));
        assert!(!logger.enabled(Level::Debug));
    }

    #[test]
    fn test_init_and_write() {
        let tmp = NamedTempFile::new().unwrap();
        let logger = Logger::new();
        logger
            .init("test-vm", Some(tmp.path().to_str().unwrap().to_string()), false)
            .unwrap();
        logger.set_level(Level::Debug);
        logger.log(Level::Info, "lib.rs:1", format_args!("hello {}", 42));
        let contents = std::fs::read_to_string(tmp.path()).unwrap();
        assert!(contents.contains("hello 42"));
        assert!(contents.contains("test-vm"));
    }

    #[test]
    fn test_metric_counters() {
        let m = SharedMetric::default();
        m.inc();
        m.add(4);
        assert_eq!(m.count(), 5);
    }
}
