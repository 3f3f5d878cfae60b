// src/logging.rs
//
// Timestamped severity logging. Messages go to stderr; when the host tool
// launches us with --logfile they are duplicated to that file so a capture
// that dies inside Wireshark still leaves a trace on disk.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

/// Global log file handle. When `Some`, `tlog!` writes to both stderr and this file.
pub static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Minimum severity that gets written. Defaults to Info.
static MIN_SEVERITY: AtomicU8 = AtomicU8::new(Severity::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Verbose = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Failure = 5,
}

impl Severity {
    /// Fixed-width label so log columns line up.
    pub fn label(self) -> &'static str {
        match self {
            Severity::Verbose => "VERBOSE",
            Severity::Debug => "DEBUG  ",
            Severity::Info => "INFO   ",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR  ",
            Severity::Failure => "FAILURE",
        }
    }

    /// Map a --loglevel argument to a severity. Out-of-range values clamp.
    pub fn from_level(level: u8) -> Severity {
        match level {
            0 => Severity::Verbose,
            1 => Severity::Debug,
            2 => Severity::Info,
            3 => Severity::Warning,
            4 => Severity::Error,
            _ => Severity::Failure,
        }
    }
}

pub fn set_min_severity(severity: Severity) {
    MIN_SEVERITY.store(severity as u8, Ordering::Relaxed);
}

pub fn enabled(severity: Severity) -> bool {
    severity as u8 >= MIN_SEVERITY.load(Ordering::Relaxed)
}

/// Open (append) the log file given on the command line.
pub fn init_file_logging(log_path: &Path) -> Result<(), String> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| format!("Failed to open log file {}: {}", log_path.display(), e))?;

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }

    // Use eprintln directly here since tlog! would try to lock LOG_FILE (which we just set)
    eprintln!(
        "{} INFO    [logging] File logging started: {}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        log_path.display()
    );

    Ok(())
}

/// Stop file logging and close the log file.
pub fn stop_file_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if guard.is_some() {
            *guard = None;
        }
    }
}

/// Timestamped logging macro.
/// Prepends `HH:MM:SS.mmm` local time, the severity label and a module tag to
/// every message written to stderr. Also writes to the log file when file
/// logging is enabled and the severity passes the --loglevel filter.
#[macro_export]
macro_rules! tlog {
    ($sev:expr, $tag:expr, $($arg:tt)*) => {{
        use std::io::Write as _;
        let sev: $crate::logging::Severity = $sev;
        if $crate::logging::enabled(sev) {
            let msg = format!(
                "{} {} [{}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                sev.label(),
                $tag,
                format_args!($($arg)*)
            );
            eprintln!("{}", msg);
            if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
                if let Some(ref mut f) = *guard {
                    let _ = writeln!(f, "{}", msg);
                }
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_filter() {
        set_min_severity(Severity::Warning);
        assert!(!enabled(Severity::Info));
        assert!(enabled(Severity::Warning));
        assert!(enabled(Severity::Failure));
        set_min_severity(Severity::Info);
    }

    #[test]
    fn level_mapping_clamps() {
        assert_eq!(Severity::from_level(0), Severity::Verbose);
        assert_eq!(Severity::from_level(3), Severity::Warning);
        assert_eq!(Severity::from_level(200), Severity::Failure);
    }
}
