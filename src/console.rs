//! Kernel console and logger
//!
//! The console is the sink for the `log` facade. Kernel code logs through
//! `log::debug!` and friends; [`KernelLogger`] formats each record and writes
//! it here. Output goes to a platform-registered sink (UART on hardware). Test
//! builds additionally capture output in a bounded buffer.

use core::fmt::{self, Write};
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Byte sink installed by the platform
pub type ConsoleSink = fn(&str);

/// Console writer interface
pub struct Console {
    sink: Option<ConsoleSink>,
    #[cfg(test)]
    buffer: heapless::String<4096>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            sink: None,
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Route console output to `sink`
    pub fn set_sink(&mut self, sink: ConsoleSink) {
        self.sink = Some(sink);
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        #[cfg(test)]
        {
            // Oldest output is dropped once the capture buffer fills up
            if self.buffer.push_str(s).is_err() {
                self.buffer.clear();
                let _ = self.buffer.push_str(s);
            }
        }

        if let Some(sink) = self.sink {
            sink(s);
        }
    }

    /// Clear the capture buffer
    pub fn clear(&mut self) {
        #[cfg(test)]
        self.buffer.clear();
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Install the output sink used by the global console
pub fn set_sink(sink: ConsoleSink) {
    CONSOLE.lock().set_sink(sink);
}

// ============================================================================
// Logger
// ============================================================================

/// `log` backend writing `[LEVEL target] message` lines to the console
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;
static LOGGER_INIT: Once<()> = Once::new();

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut console = CONSOLE.lock();
        let _ = writeln!(
            console,
            "[{:<5} {}] {}",
            level_name(record.level()),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Install the kernel logger. Later calls only adjust the level.
pub fn init(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        // Another logger may already be installed when embedded in a host
        let _ = log::set_logger(&LOGGER);
    });
    log::set_max_level(level);
}

#[cfg(test)]
pub(crate) fn captured_contains(needle: &str) -> bool {
    CONSOLE.lock().buffer.contains(needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_write() {
        let mut console = Console::new();
        console.write_str("Hello, kernel!");
        assert!(console.buffer.contains("Hello, kernel!"));
    }

    #[test]
    fn test_console_formatting() {
        let mut console = Console::new();
        write!(&mut console, "Test {}", 42).unwrap();
        assert!(console.buffer.contains("Test 42"));
        console.clear();
        assert!(console.buffer.is_empty());
    }

    #[test]
    fn test_console_buffer_wraps() {
        let mut console = Console::new();
        for _ in 0..1000 {
            console.write_str("0123456789");
        }
        assert!(console.buffer.len() <= 4096);
        assert!(console.buffer.ends_with("0123456789"));
    }

    #[test]
    fn test_logger_writes_to_console() {
        init(LevelFilter::Warn);
        log::warn!(target: "console_test", "logger marker {}", 7);
        assert!(captured_contains("[WARN  console_test] logger marker 7"));
    }
}
