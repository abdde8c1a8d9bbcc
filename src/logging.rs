//! Dual-sink logging: stderr and syslog, independently toggleable, both fed
//! by a single `log::Log` implementation so every `log::info!`/`warn!`/
//! `error!` call fans out to whichever sinks are enabled. Mirrors the
//! source's `log.c`, whose `log_common` does the same fan-out over
//! `fprintf`+`vsyslog`.

use std::io::Write;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};
use syslog::{Facility, Formatter3164, Logger, LoggerBackend};

/// The four-level verbosity ladder from the original source. `Verbose`
/// exists only as a CLI-selectable floor; it maps onto `log::Level::Debug`
/// since this crate has no finer-grained fifth level to give it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Error,
    Warn,
    Info,
    Verbose,
}

impl Verbosity {
    fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Error => LevelFilter::Error,
            Verbosity::Warn => LevelFilter::Warn,
            Verbosity::Info => LevelFilter::Info,
            Verbosity::Verbose => LevelFilter::Debug,
        }
    }
}

pub struct LogConfig {
    pub program_name: &'static str,
    pub log_to_syslog: bool,
    pub log_to_stderr: bool,
    pub verbosity: Verbosity,
}

struct DualLogger {
    program_name: &'static str,
    log_to_stderr: bool,
    syslog: Option<Mutex<Logger<LoggerBackend, Formatter3164>>>,
}

impl Log for DualLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if self.log_to_stderr {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            let _ = writeln!(
                std::io::stderr(),
                "{}.{:06} {}: {}",
                now.as_secs(),
                now.subsec_micros(),
                self.program_name,
                record.args()
            );
        }

        if let Some(logger) = &self.syslog {
            if let Ok(mut logger) = logger.lock() {
                // `log_common`'s priority table: verbose->info, info->notice,
                // warn->warning, error->err. The info->notice bump is
                // intentional and carried over unchanged.
                let result = match record.level() {
                    Level::Error => logger.err(record.args().to_string()),
                    Level::Warn => logger.warning(record.args().to_string()),
                    Level::Info => logger.notice(record.args().to_string()),
                    Level::Debug | Level::Trace => logger.info(record.args().to_string()),
                };
                let _ = result;
            }
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the dual-sink logger. Must be called exactly once, before any
/// other part of the crate logs anything.
pub fn init(config: &LogConfig) -> Result<(), crate::error::Error> {
    let syslog = if config.log_to_syslog {
        let formatter = Formatter3164 {
            facility: Facility::LOG_AUTHPRIV,
            hostname: None,
            process: config.program_name.to_string(),
            pid: std::process::id(),
        };
        match syslog::unix(formatter) {
            Ok(logger) => Some(Mutex::new(logger)),
            Err(err) => {
                eprintln!("nodm: could not connect to syslog: {err}");
                None
            }
        }
    } else {
        None
    };

    let logger = DualLogger {
        program_name: config.program_name,
        log_to_stderr: config.log_to_stderr,
        syslog,
    };

    log::set_max_level(config.verbosity.level_filter());
    log::set_boxed_logger(Box::new(logger))
        .map_err(|err| crate::error::Error::Programming(err.to_string()))
}
