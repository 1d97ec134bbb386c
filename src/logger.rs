// src/logger.rs

use chrono::Local;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;

lazy_static::lazy_static! {
    static ref CURRENT_LOG_LEVEL: RwLock<LogLevel> = RwLock::new(LogLevel::Info);
}

pub fn set_log_level(level: LogLevel) {
    let mut log_level = CURRENT_LOG_LEVEL.write().unwrap();
    *log_level = level;
}

pub fn get_log_level() -> LogLevel {
    *CURRENT_LOG_LEVEL.read().unwrap()
}

/// Formats a log line the way the source system's own logger does:
/// `[<level> <timestamp> <pid>] <message>`.
#[doc(hidden)]
pub fn format_line(level: LogLevel, message: fmt::Arguments<'_>) -> String {
    format!(
        "[{} {} {}] {}",
        level,
        Local::now().format("%y%m%d %H:%M:%S"),
        std::process::id(),
        message
    )
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        {
            let current_level = $crate::logger::get_log_level();
            if $level <= current_level {
                println!("{}", $crate::logger::format_line($level, format_args!($($arg)*)));
            }
        }
    };
}

#[derive(Debug, PartialEq, PartialOrd, Clone, Copy, Eq, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log_str = match self {
            LogLevel::Error => "E".bold().red(),
            LogLevel::Warn => "W".bold().yellow(),
            LogLevel::Info => "I".bold().green(),
            LogLevel::Debug => "D".bold().blue(),
            LogLevel::Trace => "T".bold().magenta(),
        };
        write!(f, "{}", log_str)
    }
}
