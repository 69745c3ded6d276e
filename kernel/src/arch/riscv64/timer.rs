//! Timer interrupts, driven entirely through the SBI timer extension.
//!
//! There is no memory-mapped timer comparator on this platform; every
//! reschedule deadline is set with an `ecall` into the firmware
//! ([`super::sbi::set_timer`]), which arranges for a supervisor timer
//! interrupt (`scause` interrupt code 5) the next time `time` reaches it.

use core::sync::atomic::{AtomicU64, Ordering};

use super::sbi;

/// QEMU `virt` machine timebase-frequency (Hz), per its device tree.
const TIMEBASE_FREQ: u64 = 10_000_000;
/// Scheduling quantum between timer interrupts.
const TICK_INTERVAL_MS: u64 = 10;

static TICKS: AtomicU64 = AtomicU64::new(0);

#[cfg(target_arch = "riscv64")]
fn read_time() -> u64 {
    let time: u64;
    // SAFETY: `rdtime` is a read-only counter instruction with no side
    // effects.
    unsafe { core::arch::asm!("rdtime {}", out(reg) time) };
    time
}

#[cfg(not(target_arch = "riscv64"))]
fn read_time() -> u64 {
    unreachable!("read_time is only meaningful on riscv64gc-unknown-none-elf")
}

/// Enable the supervisor timer interrupt and schedule the first tick.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    const SIE_STIE: usize = 1 << 5;
    // SAFETY: setting STIE only affects which interrupt sources this hart
    // accepts; it does not alter memory state.
    unsafe {
        core::arch::asm!("csrs sie, {}", in(reg) SIE_STIE);
    }
    schedule_next_tick();
}

#[cfg(not(target_arch = "riscv64"))]
pub fn init() {
    unreachable!("timer::init is only meaningful on riscv64gc-unknown-none-elf")
}

/// Program the next timer interrupt one quantum from now.
pub fn schedule_next_tick() {
    let interval_ticks = TIMEBASE_FREQ * TICK_INTERVAL_MS / 1000;
    sbi::set_timer(read_time() + interval_ticks);
}

/// Number of timer interrupts serviced since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Advance the tick counter. Called once per timer interrupt, before the
/// scheduler decides whether to preempt.
pub(crate) fn record_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}
