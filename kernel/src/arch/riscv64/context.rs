//! Kernel-context switching.
//!
//! A process's user-register state lives in its trap frame (§4.3); this
//! `Context` only holds the callee-saved registers a kernel thread needs
//! restored across a cooperative switch, per the standard RISC-V calling
//! convention (`ra`, `sp`, `s0`..`s11`).

use core::arch::global_asm;

/// Callee-saved kernel execution context, saved by `swtch` on one side of a
/// switch and restored on the other.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

// Save the caller's callee-saved registers into `*old` (a0), then load them
// from `*new` (a1) and return into the new context's `ra`. Written as raw
// assembly rather than a `#[naked]` fn: a normal Rust function body would
// insert a prologue that clobbers `sp` before we get a chance to save it.
//
// Gated to the real target: host-side unit tests elsewhere in the crate
// compile this module too, and a non-riscv64 assembler does not know these
// mnemonics.
#[cfg(target_arch = "riscv64")]
global_asm!(
    ".global swtch",
    "swtch:",
    "sd ra,  0(a0)",
    "sd sp,  8(a0)",
    "sd s0,  16(a0)",
    "sd s1,  24(a0)",
    "sd s2,  32(a0)",
    "sd s3,  40(a0)",
    "sd s4,  48(a0)",
    "sd s5,  56(a0)",
    "sd s6,  64(a0)",
    "sd s7,  72(a0)",
    "sd s8,  80(a0)",
    "sd s9,  88(a0)",
    "sd s10, 96(a0)",
    "sd s11, 104(a0)",
    "ld ra,  0(a1)",
    "ld sp,  8(a1)",
    "ld s0,  16(a1)",
    "ld s1,  24(a1)",
    "ld s2,  32(a1)",
    "ld s3,  40(a1)",
    "ld s4,  48(a1)",
    "ld s5,  56(a1)",
    "ld s6,  64(a1)",
    "ld s7,  72(a1)",
    "ld s8,  80(a1)",
    "ld s9,  88(a1)",
    "ld s10, 96(a1)",
    "ld s11, 104(a1)",
    "ret",
);

#[cfg(target_arch = "riscv64")]
extern "C" {
    /// Save the caller's callee-saved registers into `*old`, then load them
    /// from `*new` and return into the new context's `ra`.
    ///
    /// Both pointers must reference valid, live `Context` values; `old` is
    /// written, `new` is only read. This is the kernel's sole cooperative
    /// switch point, invoked by the scheduler with the old process's state
    /// consistent and the new process's state previously saved by a prior
    /// `swtch`.
    pub fn swtch(old: *mut Context, new: *const Context);
}

/// Host-side stand-in: the scheduler never actually reaches a `swtch` call
/// in a hosted unit test (nothing drives `schedule`/`yield_cpu` there), so
/// this only needs to exist for the crate to link.
///
/// # Safety
/// Must never actually be called; doing so is a bug in whatever test
/// exercises scheduler code on a non-riscv64 host.
#[cfg(not(target_arch = "riscv64"))]
pub unsafe fn swtch(_old: *mut Context, _new: *const Context) {
    unreachable!("swtch is only meaningful on riscv64gc-unknown-none-elf")
}
