//! `log` facade wiring (ambient stack): a [`log::Log`] implementor that
//! writes formatted records through the SBI console, one byte at a time.
//!
//! Installed exactly once at boot via [`init`]; every `log::info!`/
//! `debug!`/`trace!`/`error!` call in the kernel after that point reaches
//! [`console_putstr`].

use core::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut writer = ConsoleWriter;
        let _ = writeln!(writer, "[{:>5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Write one byte to the SBI console.
#[cfg(target_arch = "riscv64")]
fn putchar(byte: u8) {
    crate::arch::riscv64::sbi::console_putchar(byte);
}

#[cfg(not(target_arch = "riscv64"))]
fn putchar(byte: u8) {
    let _ = byte;
}

/// Write a string to the SBI console, one byte at a time.
pub fn console_putstr(s: &str) {
    for byte in s.bytes() {
        putchar(byte);
    }
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        console_putstr(s);
        Ok(())
    }
}

/// Install the kernel logger as the `log` crate's global logger. Must run
/// exactly once, before any other subsystem logs; calling it twice is a
/// boot-sequencing bug reported by the `log` crate as an error we simply
/// ignore, since by that point a logger is already installed.
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Trace);
}
