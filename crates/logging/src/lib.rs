//! Mixgate logging
//!
//! Unified logging setup for the mixgate binaries.
//!
//! ## Usage
//!
//! ```no_run
//! use mixgate_logging::{init, LogLevel};
//!
//! // Level 0 = info, 1 = debug, 2+ = trace
//! init(LogLevel::from_verbosity(0), None);
//! ```

use std::path::Path;

use tracing_subscriber::EnvFilter;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warnings and errors
    Warn,
    /// Info, warnings, and errors (default)
    #[default]
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    /// Create a log level from a verbosity count
    ///
    /// - `0` → `Info`
    /// - `1` → `Debug`
    /// - `2+` → `Trace`
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Self::Info,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Initialize logging with the specified level.
///
/// With a `log_file`, output goes to that file (created fresh, replacing
/// any previous run's log); otherwise to stderr. The `RUST_LOG`
/// environment variable overrides the level when set.
///
/// # Panics
///
/// Panics if called more than once or if the log file cannot be created.
pub fn init(level: LogLevel, log_file: Option<&Path>) {
    try_init(level, log_file).expect("Failed to initialize logging");
}

/// Try to initialize logging, returning an error if already initialized
/// or the log file is not writable.
pub fn try_init(level: LogLevel, log_file: Option<&Path>) -> Result<(), String> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|e| format!("could not open log file {}: {e}", path.display()))?;
            builder
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .try_init()
                .map_err(|e| e.to_string())
        }
        None => builder.try_init().map_err(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_verbosity() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Trace);
        assert_eq!(LogLevel::from_verbosity(10), LogLevel::Trace);
    }

    #[test]
    fn test_log_level_as_str() {
        assert_eq!(LogLevel::Error.as_str(), "error");
        assert_eq!(LogLevel::Warn.as_str(), "warn");
        assert_eq!(LogLevel::Info.as_str(), "info");
        assert_eq!(LogLevel::Debug.as_str(), "debug");
        assert_eq!(LogLevel::Trace.as_str(), "trace");
    }

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }
}
