//! The module containing the host-bridge logger implementation.
//!
//! Log records are formatted into a fixed stack buffer and handed to
//! [`HostOps::log`] as one line. Nothing here allocates, so the logger works
//! on any path the host sink itself tolerates; root-mode code must simply
//! not log, since the sink belongs to the host OS.
//!
//! [`HostOps::log`]: crate::platform::HostOps

use crate::{config::LOGGING_LEVEL, platform};
use core::fmt::Write;

/// Initializes the logger instance. [`platform::init`] must have run first.
pub fn init_logger() {
    log::set_logger(&BRIDGE_LOGGER)
        .map(|()| log::set_max_level(LOGGING_LEVEL))
        .unwrap();
}

struct BridgeLogger;

/// One log line; anything longer is truncated.
const LINE_CAPACITY: usize = 512;

struct LineBuffer {
    bytes: [u8; LINE_CAPACITY],
    used: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self {
            bytes: [0; LINE_CAPACITY],
            used: 0,
        }
    }

    fn as_str(&self) -> &str {
        // Only &str fragments are ever appended.
        core::str::from_utf8(&self.bytes[..self.used]).unwrap_or("")
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let remaining = LINE_CAPACITY - self.used;
        let taken = s.len().min(remaining);
        self.bytes[self.used..self.used + taken].copy_from_slice(&s.as_bytes()[..taken]);
        self.used += taken;
        Ok(())
    }
}

impl log::Log for BridgeLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Trace
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let mut line = LineBuffer::new();
            let cpu = (platform::ops().cpu_index)();
            let _ = write!(line, "#{}:{}: {}", cpu, record.level(), record.args());
            (platform::ops().log)(record.level(), line.as_str());
        }
    }

    fn flush(&self) {}
}

static BRIDGE_LOGGER: BridgeLogger = BridgeLogger;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_truncates_at_capacity() {
        let mut line = LineBuffer::new();
        for _ in 0..LINE_CAPACITY {
            write!(line, "ab").unwrap();
        }
        assert_eq!(line.used, LINE_CAPACITY);
        assert!(line.as_str().starts_with("abab"));
    }
}
