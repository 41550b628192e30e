// WHOIS Geo - Systemd-Style Logger
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Systemd-style logging compatible with journald
//!
//! Lookup failures are reported here and never to the requesting peer, so
//! every enrichment path logs through these macros:
//! - Log levels follow systemd priorities (emerg .. debug)
//! - Terminal output with optional colors, or `KEY=value` journald records
//! - Startup banners in the `[   OK   ]` / `[  FAILED ]` style

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Log levels following systemd priority conventions
/// https://www.freedesktop.org/software/systemd/man/sd-daemon.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl LogLevel {
    pub fn from_priority(priority: u8) -> Self {
        match priority {
            0 => LogLevel::Emergency,
            1 => LogLevel::Alert,
            2 => LogLevel::Critical,
            3 => LogLevel::Error,
            4 => LogLevel::Warning,
            5 => LogLevel::Notice,
            7 => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    pub fn priority(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Emergency => "EMERG",
            LogLevel::Alert => "ALERT",
            LogLevel::Critical => "CRIT",
            LogLevel::Error => "ERR",
            LogLevel::Warning => "WARNING",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    /// Terminal color for this level
    pub fn color_code(self) -> &'static str {
        match self {
            LogLevel::Emergency => "\x1b[1;41m",
            LogLevel::Alert => "\x1b[1;91m",
            LogLevel::Critical => "\x1b[1;31m",
            LogLevel::Error => "\x1b[31m",
            LogLevel::Warning => "\x1b[33m",
            LogLevel::Notice => "\x1b[36m",
            LogLevel::Info => "\x1b[32m",
            LogLevel::Debug => "\x1b[37m",
        }
    }
}

/// Status tags written by the banner helpers, with the level used to color them
const STATUS_TAGS: &[(&str, LogLevel)] = &[
    ("[  FAILED ]", LogLevel::Error),
    ("[   WARN ]", LogLevel::Warning),
    ("[   OK   ]", LogLevel::Info),
    ("[*]", LogLevel::Notice),
];

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Minimum log level to output
    pub min_level: LogLevel,
    pub use_colors: bool,
    pub include_timestamp: bool,
    /// Include the module path (journald `CODE_FILE`)
    pub include_target: bool,
    /// Emit journald `KEY=value` records instead of terminal lines
    pub journald_format: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            use_colors: atty::is(atty::Stream::Stderr),
            include_timestamp: true,
            include_target: false,
            journald_format: false,
        }
    }
}

static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

#[derive(Debug)]
pub struct Logger {
    config: LoggerConfig,
    min_level: AtomicU8,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self {
            min_level: AtomicU8::new(config.min_level.priority()),
            config,
        }
    }

    /// Install the process-wide logger
    pub fn init(config: LoggerConfig) -> Result<(), LoggerError> {
        let mut global_logger = LOGGER.lock().map_err(|_| LoggerError::InitError)?;
        if global_logger.is_some() {
            return Err(LoggerError::AlreadyInitialized);
        }
        *global_logger = Some(Self::new(config));
        Ok(())
    }

    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level.priority(), Ordering::Relaxed);
    }

    pub fn should_log(&self, level: LogLevel) -> bool {
        level.priority() <= self.min_level.load(Ordering::Relaxed)
    }

    pub fn log(&self, level: LogLevel, target: &str, message: &str) {
        if !self.should_log(level) {
            return;
        }
        eprintln!("{}", self.format(level, target, message, current_timestamp()));
    }

    fn format(&self, level: LogLevel, target: &str, message: &str, timestamp: u64) -> String {
        let timestamp = self.config.include_timestamp.then_some(timestamp);
        if self.config.journald_format {
            self.format_journald(level, target, message, timestamp)
        } else {
            self.format_terminal(level, message, timestamp)
        }
    }

    fn format_journald(
        &self,
        level: LogLevel,
        target: &str,
        message: &str,
        timestamp: Option<u64>,
    ) -> String {
        let mut output = format!("PRIORITY={}\nMESSAGE={}\n", level.priority(), message);

        if self.config.include_target && !target.is_empty() {
            output.push_str(&format!("CODE_FILE={}\n", target));
        }

        if let Some(ts) = timestamp {
            // journald expects microseconds
            output.push_str(&format!("_SOURCE_REALTIME_TIMESTAMP={}\n", ts * 1_000_000));
        }

        output.push_str("SYSLOG_IDENTIFIER=whois-geo\n");
        output
    }

    fn format_terminal(&self, level: LogLevel, message: &str, timestamp: Option<u64>) -> String {
        let mut output = String::new();

        if let Some(ts) = timestamp {
            let datetime = chrono::DateTime::from_timestamp(ts as i64, 0)
                .unwrap_or_default()
                .format("%Y-%m-%d %H:%M:%S");
            output.push_str(&format!("{} ", datetime));
        }

        let status = STATUS_TAGS
            .iter()
            .find(|(tag, _)| message.starts_with(tag))
            .map(|(_, status_level)| *status_level);

        match (status, self.config.use_colors) {
            // Banner lines already carry their status, only color them
            (Some(status_level), true) => {
                output.push_str(&format!("{}{}\x1b[0m", status_level.color_code(), message))
            }
            (Some(_), false) => output.push_str(message),
            (None, true) => output.push_str(&format!(
                "{}[{}]\x1b[0m {}",
                level.color_code(),
                level.as_str(),
                message
            )),
            (None, false) => output.push_str(&format!("[{}] {}", level.as_str(), message)),
        }

        output
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Error, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Warning, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_notice {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Notice, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Info, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Debug, module_path!(), &format!($($arg)*))
    };
}

/// Backing function for the `log_*!` macros
pub fn log_with_level(level: LogLevel, target: &str, message: &str) {
    if let Ok(logger_guard) = LOGGER.lock() {
        if let Some(ref logger) = *logger_guard {
            logger.log(level, target, message);
        }
    }
}

pub fn log_init_start(service_name: &str) {
    log_with_level(
        LogLevel::Notice,
        module_path!(),
        &format!("[*] Starting {}...", service_name),
    );
}

pub fn log_init_ok(service_name: &str) {
    log_with_level(
        LogLevel::Info,
        module_path!(),
        &format!("[   OK   ] Starting {}", service_name),
    );
}

pub fn log_init_ok_with_details(service_name: &str, details: &str) {
    log_with_level(
        LogLevel::Info,
        module_path!(),
        &format!("[   OK   ] Starting {} ({})", service_name, details),
    );
}

pub fn log_init_failed(service_name: &str, error: &str) {
    log_with_level(
        LogLevel::Error,
        module_path!(),
        &format!("[  FAILED ] Starting {} - {}", service_name, error),
    );
}

pub fn log_init_warn(service_name: &str, warning: &str) {
    log_with_level(
        LogLevel::Warning,
        module_path!(),
        &format!("[   WARN ] Starting {} - {}", service_name, warning),
    );
}

#[macro_export]
macro_rules! log_init_start {
    ($service:expr) => {
        $crate::core::logger::log_init_start($service);
    };
}

#[macro_export]
macro_rules! log_init_ok {
    ($service:expr) => {
        $crate::core::logger::log_init_ok($service);
    };
}

#[macro_export]
macro_rules! log_init_ok_with_details {
    ($service:expr, $details:expr) => {
        $crate::core::logger::log_init_ok_with_details($service, $details);
    };
}

#[macro_export]
macro_rules! log_init_failed {
    ($service:expr, $error:expr) => {
        $crate::core::logger::log_init_failed($service, $error);
    };
}

#[macro_export]
macro_rules! log_init_warn {
    ($service:expr, $warning:expr) => {
        $crate::core::logger::log_init_warn($service, $warning);
    };
}

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("Logger already initialized")]
    AlreadyInitialized,
    #[error("Failed to initialize logger")]
    InitError,
}

/// Initialize logger from CLI arguments
pub fn init_from_args(debug: bool, trace: bool, journald: bool) -> Result<(), LoggerError> {
    let min_level = if debug || trace {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    Logger::init(LoggerConfig {
        min_level,
        use_colors: atty::is(atty::Stream::Stderr) && !journald,
        include_timestamp: !journald,
        include_target: trace,
        journald_format: journald,
    })
}
