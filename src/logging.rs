//! Structured diagnostics.
//!
//! Components never decide where messages go. They log through
//! [`Diagnostics`], which forwards `(level, location, message)` to an
//! injected [`Logger`]. The default logger hands records to the `log` facade.

use crate::config::MAX_ERROR_LENGTH;
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Mutex, PoisonError};

/// Severity of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Normal,
    Verbose,
    Error,
}

impl LogLevel {
    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Normal | LogLevel::Verbose => log::Level::Info,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// Sink for diagnostic messages.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, location: &'static Location<'static>, message: &str);
}

/// Logger forwarding to the `log` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateLogger;

impl Logger for LogCrateLogger {
    fn log(&self, level: LogLevel, location: &'static Location<'static>, message: &str) {
        log::logger().log(
            &log::Record::builder()
                .level(level.as_log_level())
                .target(module_path!())
                .file(Some(location.file()))
                .line(Some(location.line()))
                .args(format_args!("{}", message))
                .build(),
        );
    }
}

/// Shared diagnostics handle used by every component.
pub struct Diagnostics {
    logger: Arc<dyn Logger>,
    debug: bool,
    last_error: Mutex<Option<String>>,
}

impl Diagnostics {
    pub fn new(logger: Arc<dyn Logger>, debug: bool) -> Self {
        Self {
            logger,
            debug,
            last_error: Mutex::new(None),
        }
    }

    /// Whether debug messages are emitted.
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// Last error-level message, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[track_caller]
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if self.debug {
            self.emit(LogLevel::Debug, Location::caller(), args);
        }
    }

    #[track_caller]
    pub fn normal(&self, args: fmt::Arguments<'_>) {
        self.emit(LogLevel::Normal, Location::caller(), args);
    }

    #[track_caller]
    pub fn verbose(&self, args: fmt::Arguments<'_>) {
        self.emit(LogLevel::Verbose, Location::caller(), args);
    }

    #[track_caller]
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.emit(LogLevel::Error, Location::caller(), args);
    }

    fn emit(&self, level: LogLevel, location: &'static Location<'static>, args: fmt::Arguments<'_>) {
        let mut message = args.to_string();
        truncate_message(&mut message);
        if level == LogLevel::Error {
            *self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(message.clone());
        }
        self.logger.log(level, location, &message);
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Arc::new(LogCrateLogger), false)
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

/// Cut a message to `MAX_ERROR_LENGTH` bytes on a char boundary.
fn truncate_message(message: &mut String) {
    if message.len() <= MAX_ERROR_LENGTH {
        return;
    }
    let mut end = MAX_ERROR_LENGTH;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Logger recording every message, for assertions.
    #[derive(Default)]
    pub(crate) struct CaptureLogger {
        pub(crate) records: Mutex<Vec<(LogLevel, String, u32)>>,
    }

    impl Logger for CaptureLogger {
        fn log(&self, level: LogLevel, location: &'static Location<'static>, message: &str) {
            self.records
                .lock()
                .unwrap()
                .push((level, message.to_string(), location.line()));
        }
    }

    #[test]
    fn test_debug_filtered_unless_enabled() {
        let capture = Arc::new(CaptureLogger::default());
        let diag = Diagnostics::new(capture.clone(), false);
        diag.debug(format_args!("hidden"));
        diag.normal(format_args!("shown"));

        let records = capture.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, LogLevel::Normal);
    }

    #[test]
    fn test_location_is_caller() {
        let capture = Arc::new(CaptureLogger::default());
        let diag = Diagnostics::new(capture.clone(), true);
        let line = line!() + 1;
        diag.debug(format_args!("here"));

        assert_eq!(capture.records.lock().unwrap()[0].2, line);
    }

    #[test]
    fn test_last_error_kept() {
        let diag = Diagnostics::new(Arc::new(CaptureLogger::default()), false);
        assert!(diag.last_error().is_none());
        diag.error(format_args!("Device {} is too small.", "/dev/sdz"));
        diag.verbose(format_args!("not an error"));
        assert_eq!(diag.last_error().unwrap(), "Device /dev/sdz is too small.");
    }

    #[test]
    fn test_long_message_truncated_on_char_boundary() {
        let mut message = "é".repeat(MAX_ERROR_LENGTH);
        truncate_message(&mut message);
        assert!(message.len() <= MAX_ERROR_LENGTH);
        assert!(message.chars().all(|c| c == 'é'));
    }
}
