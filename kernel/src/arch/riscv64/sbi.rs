//! SBI (Supervisor Binary Interface) calls into the M-mode firmware.
//!
//! The kernel never talks to the console UART or the timer comparator
//! directly; both are collaborators reached through `ecall` per the SBI
//! specification, matching this kernel's external-interfaces boundary.

/// Base extension, used to probe for optional extensions and query the
/// firmware implementation.
const SBI_EXT_BASE: usize = 0x10;
/// Timer extension ("TIME" in ASCII, read little-endian as a usize).
const SBI_EXT_TIMER: usize = 0x5449_4D45;
/// Legacy console-putchar extension ID doubles as its own function ID.
const SBI_EXT_CONSOLE_PUTCHAR: usize = 0x01;
/// Legacy console-getchar extension ID doubles as its own function ID.
const SBI_EXT_CONSOLE_GETCHAR: usize = 0x02;

const SBI_BASE_PROBE_EXTENSION: usize = 3;
const SBI_TIMER_SET_TIMER: usize = 0;

/// Result of an SBI call: an error code and a return value, per the SBI
/// calling convention (`a0`/`a1` on return).
#[derive(Debug, Clone, Copy)]
pub struct SbiRet {
    pub error: isize,
    pub value: usize,
}

impl SbiRet {
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }
}

#[inline(always)]
#[cfg(target_arch = "riscv64")]
fn sbi_call(extension: usize, function: usize, arg0: usize, arg1: usize, arg2: usize) -> SbiRet {
    let error: isize;
    let value: usize;
    // SAFETY: `ecall` traps to M-mode firmware, which implements the SBI
    // calling convention: extension in a7, function in a6, arguments in
    // a0..a2, and the pair (error, value) returned in a0/a1. This does not
    // touch kernel memory.
    unsafe {
        core::arch::asm!(
            "ecall",
            in("a0") arg0,
            in("a1") arg1,
            in("a2") arg2,
            in("a6") function,
            in("a7") extension,
            lateout("a0") error,
            lateout("a1") value,
        );
    }
    SbiRet { error, value }
}

/// Host builds never reach an `ecall`; the only host-side test in this
/// module (`sbi_ret_is_ok_reflects_error_code`) exercises `SbiRet` directly.
#[inline(always)]
#[cfg(not(target_arch = "riscv64"))]
fn sbi_call(_extension: usize, _function: usize, _arg0: usize, _arg1: usize, _arg2: usize) -> SbiRet {
    unreachable!("sbi_call is only meaningful on riscv64gc-unknown-none-elf")
}

/// Program the next timer interrupt to fire at absolute time `stime_value`,
/// measured in the platform's timebase (QEMU `virt`: 10 MHz).
pub fn set_timer(stime_value: u64) {
    sbi_call(SBI_EXT_TIMER, SBI_TIMER_SET_TIMER, stime_value as usize, 0, 0);
}

/// Probe whether an SBI extension is implemented by the firmware.
pub fn probe_extension(extension_id: usize) -> bool {
    sbi_call(SBI_EXT_BASE, SBI_BASE_PROBE_EXTENSION, extension_id, 0, 0).value != 0
}

/// Write one byte to the firmware console (legacy SBI extension).
///
/// This is the kernel's only path to standard output; the logger (§4.10)
/// writes through this one byte at a time.
pub fn console_putchar(ch: u8) {
    sbi_call(SBI_EXT_CONSOLE_PUTCHAR, 0, ch as usize, 0, 0);
}

/// Read one byte from the firmware console, or `None` if nothing is
/// waiting (legacy SBI extension returns -1 on an empty input queue).
pub fn console_getchar() -> Option<u8> {
    let ret = sbi_call(SBI_EXT_CONSOLE_GETCHAR, 0, 0, 0, 0);
    if ret.error < 0 {
        None
    } else {
        Some(ret.error as u8)
    }
}

/// Log firmware diagnostics and confirm the timer extension is present.
/// The timer extension is required; its absence is fatal since the
/// scheduler has no other way to regain control from a running process.
pub fn init() {
    let timer_available = probe_extension(SBI_EXT_TIMER);
    log::info!("sbi: timer extension available = {timer_available}");
    if !timer_available {
        crate::kpanic!("SBI timer extension (\"TIME\") is required but not implemented");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbi_ret_is_ok_reflects_error_code() {
        assert!(SbiRet { error: 0, value: 0 }.is_ok());
        assert!(!SbiRet { error: -1, value: 0 }.is_ok());
    }
}
