//! Logging module
//!
//! Session logging to stderr and to a per-session log file. Components log
//! through the `log_*!` macros with a module tag:
//!
//! ```ignore
//! const MODULE: &str = "download";
//! log_info!(MODULE, "Download size: {} bytes", total);
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use chrono::Local;
use once_cell::sync::Lazy;

use crate::config;

/// Log severity, ordered from most to least verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

struct SessionLog {
    file: Option<File>,
    path: Option<PathBuf>,
}

static SESSION: Lazy<Mutex<SessionLog>> = Lazy::new(|| {
    Mutex::new(SessionLog {
        file: None,
        path: None,
    })
});

static MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static ECHO_STDERR: AtomicBool = AtomicBool::new(true);

/// Initialize the session log file under the platform data directory
pub fn init() {
    let dir = dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(config::app::NAME)
        .join("logs");
    init_in(&dir);
}

/// Initialize the session log file inside `dir`
///
/// Failure to create the file is not fatal: logging continues on stderr.
pub fn init_in(dir: &Path) {
    let file_name = format!("session-{}.log", Local::now().format("%Y%m%d-%H%M%S"));
    let path = dir.join(file_name);

    let opened = std::fs::create_dir_all(dir).and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
    });

    match opened {
        Ok(file) => {
            if let Ok(mut session) = SESSION.lock() {
                session.file = Some(file);
                session.path = Some(path);
            }
            prune_old_logs(dir);
        }
        Err(e) => {
            eprintln!("Failed to open log file {}: {}", path.display(), e);
        }
    }
}

/// Keep only the newest session logs
fn prune_old_logs(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut logs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
        .collect();

    if logs.len() <= config::logging::MAX_SESSION_LOGS {
        return;
    }

    // Session names embed a sortable timestamp
    logs.sort();
    let excess = logs.len() - config::logging::MAX_SESSION_LOGS;
    for old in logs.into_iter().take(excess) {
        let _ = std::fs::remove_file(old);
    }
}

/// Switch between DEBUG (developer mode) and INFO
pub fn set_log_level(debug: bool) {
    let level = if debug { Level::Debug } else { Level::Info };
    MIN_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Whether DEBUG lines are currently emitted
pub fn is_debug() -> bool {
    MIN_LEVEL.load(Ordering::SeqCst) == Level::Debug as u8
}

/// Enable or disable mirroring of log lines to stderr
pub fn set_stderr_echo(enabled: bool) {
    ECHO_STDERR.store(enabled, Ordering::SeqCst);
}

/// Path of the current session log, if one is open
pub fn log_path() -> Option<PathBuf> {
    SESSION.lock().ok().and_then(|s| s.path.clone())
}

/// Read back the current session log
pub fn get_logs() -> std::io::Result<String> {
    match log_path() {
        Some(path) => std::fs::read_to_string(path),
        None => Ok(String::new()),
    }
}

/// Newest session log other than the current one
pub fn previous_session_log() -> Option<PathBuf> {
    let current = log_path()?;
    let dir = current.parent()?;
    let mut logs: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log") && *p != current)
        .collect();
    logs.sort();
    logs.pop()
}

fn format_line(level: Level, module: &str, args: fmt::Arguments<'_>) -> String {
    format!(
        "[{}] [{}] [{}] {}",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        level.as_str(),
        module,
        args
    )
}

/// Emit one log line. Use the `log_*!` macros instead of calling this directly.
pub fn log(level: Level, module: &str, args: fmt::Arguments<'_>) {
    if (level as u8) < MIN_LEVEL.load(Ordering::SeqCst) {
        return;
    }

    let line = format_line(level, module, args);

    if ECHO_STDERR.load(Ordering::SeqCst) {
        eprintln!("{}", line);
    }

    if let Ok(mut session) = SESSION.lock() {
        if let Some(file) = session.file.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

#[macro_export]
macro_rules! log_debug {
    ($module:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::Level::Debug, $module, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($module:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::Level::Info, $module, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($module:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::Level::Warn, $module, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($module:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::Level::Error, $module, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn test_format_line() {
        let line = format_line(Level::Warn, "cache", format_args!("entry {} stale", 3));
        assert!(line.contains("[WARN] [cache] entry 3 stale"));
    }

    #[test]
    fn test_session_log_readback_respects_level() {
        let dir = tempfile::tempdir().unwrap();
        set_stderr_echo(false);
        init_in(dir.path());
        assert!(log_path().unwrap().starts_with(dir.path()));

        set_log_level(false);
        assert!(!is_debug());
        log(Level::Debug, "test", format_args!("hidden detail"));
        log(Level::Info, "test", format_args!("visible line"));

        set_log_level(true);
        assert!(is_debug());
        log(Level::Debug, "test", format_args!("debug detail"));
        set_log_level(false);

        let logs = get_logs().unwrap();
        assert!(logs.contains("[INFO] [test] visible line"));
        assert!(logs.contains("[DEBUG] [test] debug detail"));
        assert!(!logs.contains("hidden detail"));
    }
}
