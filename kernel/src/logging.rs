//! `log` facade backed by the console.

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::println;

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        println!("[{tag}] [{}] {}", record.target(), record.args());
    }

    fn flush(&self) {}
}

pub fn init() {
    log::set_logger(&LOGGER).expect("logger installed twice");
    log::set_max_level(if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
}
