//! Kernel logger for the `log` facade.

use alloc::boxed::Box;
use core::fmt;
use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::race::OnceBox;

/// Where formatted log lines go, e.g. the serial port.
pub type Sink = fn(fmt::Arguments);

static SINK: OnceBox<Sink> = OnceBox::new();

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(sink) = SINK.get() else {
            return;
        };
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        };
        sink(format_args!(
            "\u{1B}[{}m[{:>5}] {}: {}\u{1B}[0m\n",
            color,
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Install the kernel logger, writing to `sink`. Returns `false` if a logger was
/// already installed.
pub fn init(sink: Sink, level: LevelFilter) -> bool {
    static LOGGER: KernelLogger = KernelLogger;
    if SINK.set(Box::new(sink)).is_err() {
        return false;
    }
    if log::set_logger(&LOGGER).is_err() {
        return false;
    }
    log::set_max_level(level);
    true
}

/// Parse a level name as given in the `LOG` build variable. Anything unrecognized
/// means `Info`.
pub fn level_from_str(level: Option<&str>) -> LevelFilter {
    match level {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        Some("OFF") => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// The level selected by the `LOG` variable at build time.
pub fn build_level() -> LevelFilter {
    level_from_str(option_env!("LOG"))
}
