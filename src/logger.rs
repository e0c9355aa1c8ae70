//! A minimal stderr backend for the [`log`] facade.
//!
//! Applications that already install a logger do not need this. Everything in the crate logs through the `log` macros, so any backend
//! works.

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::options;

struct StderrLogger {
    level: LevelFilter
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE"
    }
}

fn level_color(level: Level) -> u8 {
    match level {
        Level::Error => 31,
        Level::Warn => 33,
        Level::Info => 37,
        Level::Debug => 36,
        Level::Trace => 90
    }
}

fn format_record(record: &Record) -> String {
    format!(
        "[\x1b[{}m{}\x1b[0m] {}: {}\n",
        level_color(record.level()),
        level_name(record.level()),
        record.target(),
        record.args()
    )
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // A single write keeps lines from different OS threads from interleaving.
            let _ = std::io::stderr().lock().write_all(format_record(record).as_bytes());
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Installs the stderr logger. The level is taken from the `log` runtime option and defaults to `warn`.
///
/// Returns an error if another logger has already been installed.
pub fn init() -> Result<(), SetLoggerError> {
    init_with_level(options::get().get("log").unwrap_or(LevelFilter::Warn))
}

pub fn init_with_level(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(StderrLogger { level }))?;
    log::set_max_level(level);
    Ok(())
}
