//! File logging for hook processes.
//!
//! Log levels:
//! - ERROR: Failures that forced a fail-open decision
//! - WARN: Recoverable surprises (corrupt snapshot, lock contention, retry exhaustion)
//! - INFO: Pipeline lifecycle events (classification, stage completion, blocks)
//! - DEBUG: Detailed traces of gate and DAG decisions
//! - TRACE: Raw hook payloads and snapshot contents
//!
//! Every hook runs as its own short-lived process, so the log file is appended
//! to rather than truncated, and rolled over to `stagehand.log.1` once it
//! grows past `MAX_LOG_BYTES`. Nothing is ever written to stdout from here.
//!
//! The level comes from `STAGEHAND_LOG` (`error` .. `trace`); `--debug` or
//! `STAGEHAND_DEBUG=1` raise it to at least DEBUG.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::config::Config;

const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(crate::Error::Validation(format!("Unknown log level: {}", other))),
        }
    }
}

/// Resolve the effective level from the environment and the `--debug` flag.
fn resolve_level(debug: bool, env_level: Option<&str>, env_debug: Option<&str>) -> LogLevel {
    let base = env_level
        .and_then(|v| v.parse().ok())
        .unwrap_or(LogLevel::Info);
    let debug = debug || matches!(env_debug, Some(v) if v == "1" || v.eq_ignore_ascii_case("true"));
    if debug {
        base.max(LogLevel::Debug)
    } else {
        base
    }
}

/// Initialize logging to `<base dir>/stagehand.log`.
pub fn init() {
    init_with_debug(false);
}

pub fn init_with_debug(debug: bool) {
    let level = resolve_level(
        debug,
        std::env::var("STAGEHAND_LOG").ok().as_deref(),
        std::env::var("STAGEHAND_DEBUG").ok().as_deref(),
    );
    set_level(level);

    if let Ok(base) = Config::base_dir() {
        let _ = fs::create_dir_all(&base);
        let path = base.join("stagehand.log");
        roll_over(&path, MAX_LOG_BYTES);
        LOG_PATH.set(path).ok();
    }
}

/// Move an oversized log aside, replacing any previous `.1` file.
fn roll_over(path: &Path, max_bytes: u64) {
    let too_big = fs::metadata(path)
        .map(|m| m.len() > max_bytes)
        .unwrap_or(false);
    if too_big {
        let mut rolled = path.as_os_str().to_owned();
        rolled.push(".1");
        let _ = fs::rename(path, PathBuf::from(rolled));
    }
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Whether a message at `level` would be written.
pub fn enabled(level: LogLevel) -> bool {
    level <= get_level() && LOG_PATH.get().is_some()
}

pub fn log_at(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(
            file,
            "[{}] [{}] [pid {}] {}",
            timestamp,
            level.as_str(),
            std::process::id(),
            msg
        );
    }
}

/// Log at INFO level.
#[macro_export]
macro_rules! shlog {
    ($($arg:tt)*) => {
        $crate::__shlog_at!($crate::log::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! shlog_error {
    ($($arg:tt)*) => {
        $crate::__shlog_at!($crate::log::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! shlog_warn {
    ($($arg:tt)*) => {
        $crate::__shlog_at!($crate::log::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! shlog_debug {
    ($($arg:tt)*) => {
        $crate::__shlog_at!($crate::log::LogLevel::Debug, $($arg)*)
    };
}

/// Log at TRACE level. Payload dumps go here.
#[macro_export]
macro_rules! shlog_trace {
    ($($arg:tt)*) => {
        $crate::__shlog_at!($crate::log::LogLevel::Trace, $($arg)*)
    };
}

/// Formats only when the level is enabled.
#[doc(hidden)]
#[macro_export]
macro_rules! __shlog_at {
    ($level:expr, $($arg:tt)*) => {
        if $crate::log::enabled($level) {
            $crate::log::log_at($level, &format!($($arg)*));
        }
    };
}
