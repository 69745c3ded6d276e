//! Trap entry/exit and dispatch (§4.3).
//!
//! Two trap paths exist, mirroring the two privilege levels a trap can be
//! taken from:
//!
//! - A trap taken while already in S-mode (the kernel's own code) is
//!   handled by `kernelvec`, which saves caller-saved registers to the
//!   current kernel stack and calls [`kernel_trap`]. Only timer interrupts
//!   are expected here; anything else is a kernel bug.
//! - A trap taken from U-mode (a syscall, a page fault, a timer or
//!   external-device interrupt while a process is running) is handled by
//!   `uservec`, which saves the full user register file into the
//!   process's trap frame, switches to the kernel's page table and stack,
//!   and calls [`user_trap`]. Returning to user mode runs the reverse
//!   sequence in `userret`.
//!
//! Both vectors and the trap frame layout are grounded in the same
//! mechanism xv6-style kernels use: a fixed, per-process trap frame page
//! mapped at the same virtual address ([`crate::config::TRAPFRAME`]) in
//! every address space, and a trampoline page ([`crate::config::TRAMPOLINE`])
//! mapped identically (same physical frame) in every address space so the
//! `satp` switch inside `uservec`/`userret` does not fault.

use core::arch::global_asm;

use crate::config::{TRAMPOLINE, TRAPFRAME};

/// Per-process trap frame: the full user register file plus the kernel
/// state `uservec` needs to restore before calling into the kernel proper.
///
/// Field order and offsets are load-bearing: `uservec`/`userret` address
/// these by byte offset, not by name.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    /// `satp` value for the kernel page table, reloaded on trap entry.
    pub kernel_satp: usize,
    /// Top of this process's kernel stack, reloaded on trap entry.
    pub kernel_sp: usize,
    /// Address of [`user_trap`], called once the kernel stack is live.
    pub kernel_trap: usize,
    /// Saved `sepc` at the moment of the trap: the user instruction to
    /// resume at (or, for a syscall, the `ecall` to skip past).
    pub epc: usize,
    /// Hart ID, reloaded into `tp` on trap entry (always 0 on this target).
    pub kernel_hartid: usize,
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
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
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
}

/// `scause` value when a trap is an interrupt rather than an exception
/// (top bit set).
const SCAUSE_INTERRUPT: usize = 1 << 63;
/// Exception code for an `ecall` taken from U-mode.
const EXC_ECALL_FROM_U: usize = 8;
/// Exception codes for the three memory-access fault classes.
const EXC_INSTRUCTION_PAGE_FAULT: usize = 12;
const EXC_LOAD_PAGE_FAULT: usize = 13;
const EXC_STORE_PAGE_FAULT: usize = 15;
/// Interrupt code for a supervisor timer interrupt.
const IRQ_S_TIMER: usize = 5;
/// Interrupt code for a supervisor external interrupt (PLIC).
const IRQ_S_EXTERNAL: usize = 9;

// Trap entry while already in S-mode: save caller-saved registers on the
// current kernel stack, call kernel_trap, restore, and sret. Only ever
// reached by a timer interrupt firing while the kernel itself is running
// (there is no kernel-mode syscall or page fault).
//
// All three vectors below are gated to the real target: this module is
// compiled for the development host too, by the host-side `#[cfg(test)]`
// unit tests living elsewhere in the crate, and a non-riscv64 assembler
// cannot process these mnemonics regardless of whether anything calls in.
#[cfg(target_arch = "riscv64")]
global_asm!(
    ".globl kernelvec",
    ".align 4",
    "kernelvec:",
    "addi sp, sp, -256",
    "sd ra, 0(sp)",
    "sd sp, 8(sp)",
    "sd gp, 16(sp)",
    "sd tp, 24(sp)",
    "sd t0, 32(sp)",
    "sd t1, 40(sp)",
    "sd t2, 48(sp)",
    "sd a0, 72(sp)",
    "sd a1, 80(sp)",
    "sd a2, 88(sp)",
    "sd a3, 96(sp)",
    "sd a4, 104(sp)",
    "sd a5, 112(sp)",
    "sd a6, 120(sp)",
    "sd a7, 128(sp)",
    "sd t3, 216(sp)",
    "sd t4, 224(sp)",
    "sd t5, 232(sp)",
    "sd t6, 240(sp)",
    "call kernel_trap",
    "ld ra, 0(sp)",
    "ld gp, 16(sp)",
    "ld tp, 24(sp)",
    "ld t0, 32(sp)",
    "ld t1, 40(sp)",
    "ld t2, 48(sp)",
    "ld a0, 72(sp)",
    "ld a1, 80(sp)",
    "ld a2, 88(sp)",
    "ld a3, 96(sp)",
    "ld a4, 104(sp)",
    "ld a5, 112(sp)",
    "ld a6, 120(sp)",
    "ld a7, 128(sp)",
    "ld t3, 216(sp)",
    "ld t4, 224(sp)",
    "ld t5, 232(sp)",
    "ld t6, 240(sp)",
    "addi sp, sp, 256",
    "sret",
);

// Trap entry from U-mode, mapped at the top of every address space
// (TRAMPOLINE). `a0` holds TRAPFRAME on entry by convention (set by
// userret before the process last resumed); every other register belongs
// to the user process and must be preserved.
//
// uservec and userret live in their own page-aligned, page-sized linker
// section so the single physical frame backing them can be mapped at
// TRAMPOLINE in every address space, identically. The kernel's own page
// table is identity-mapped over RAM, so the address of `trampoline_start`
// observed while running kernel code is already this frame's physical
// address.
#[cfg(target_arch = "riscv64")]
global_asm!(
    ".section .trampoline,\"ax\",@progbits",
    ".p2align 12",
    ".globl trampoline_start",
    "trampoline_start:",
    ".globl uservec",
    "uservec:",
    "csrrw a0, sscratch, a0",
    "sd ra,  40(a0)",
    "sd sp,  48(a0)",
    "sd gp,  56(a0)",
    "sd tp,  64(a0)",
    "sd t0,  72(a0)",
    "sd t1,  80(a0)",
    "sd t2,  88(a0)",
    "sd s0,  96(a0)",
    "sd s1,  104(a0)",
    "sd a1,  120(a0)",
    "sd a2,  128(a0)",
    "sd a3,  136(a0)",
    "sd a4,  144(a0)",
    "sd a5,  152(a0)",
    "sd a6,  160(a0)",
    "sd a7,  168(a0)",
    "sd s2,  176(a0)",
    "sd s3,  184(a0)",
    "sd s4,  192(a0)",
    "sd s5,  200(a0)",
    "sd s6,  208(a0)",
    "sd s7,  216(a0)",
    "sd s8,  224(a0)",
    "sd s9,  232(a0)",
    "sd s10, 240(a0)",
    "sd s11, 248(a0)",
    "sd t3,  256(a0)",
    "sd t4,  264(a0)",
    "sd t5,  272(a0)",
    "sd t6,  280(a0)",
    "csrr t0, sscratch",
    "sd t0, 112(a0)",
    "ld sp,  8(a0)",
    "ld tp, 32(a0)",
    "ld t0, 16(a0)",
    "ld t1, 0(a0)",
    "csrw satp, t1",
    "sfence.vma zero, zero",
    "jr t0",
);

// Resume a process: install its trap frame into sscratch, switch satp,
// restore its saved registers, and sret into user mode. Called with `a0`
// = TRAPFRAME and `a1` = user satp.
#[cfg(target_arch = "riscv64")]
global_asm!(
    ".globl userret",
    ".align 4",
    "userret:",
    "csrw satp, a1",
    "sfence.vma zero, zero",
    "csrw sscratch, a0",
    "ld ra,  40(a0)",
    "ld sp,  48(a0)",
    "ld gp,  56(a0)",
    "ld tp,  64(a0)",
    "ld t0,  72(a0)",
    "ld t1,  80(a0)",
    "ld t2,  88(a0)",
    "ld s0,  96(a0)",
    "ld s1,  104(a0)",
    "ld a1,  120(a0)",
    "ld a2,  128(a0)",
    "ld a3,  136(a0)",
    "ld a4,  144(a0)",
    "ld a5,  152(a0)",
    "ld a6,  160(a0)",
    "ld a7,  168(a0)",
    "ld s2,  176(a0)",
    "ld s3,  184(a0)",
    "ld s4,  192(a0)",
    "ld s5,  200(a0)",
    "ld s6,  208(a0)",
    "ld s7,  216(a0)",
    "ld s8,  224(a0)",
    "ld s9,  232(a0)",
    "ld s10, 240(a0)",
    "ld s11, 248(a0)",
    "ld t3,  256(a0)",
    "ld t4,  264(a0)",
    "ld t5,  272(a0)",
    "ld t6,  280(a0)",
    "ld a0,  112(a0)",
    "sret",
    ".space 4096 - (. - trampoline_start)",
    ".previous",
);

#[cfg(target_arch = "riscv64")]
extern "C" {
    fn kernelvec();
    static trampoline_start: u8;
}

/// Physical address of the one-page trampoline section (`uservec` and
/// `userret`). Identity-mapped like the rest of the kernel image, so this
/// doubles as the physical frame [`crate::mm::page_table::create_user_pagetable`]
/// maps at [`crate::config::TRAMPOLINE`] in every address space.
#[cfg(target_arch = "riscv64")]
pub fn trampoline_phys() -> usize {
    // SAFETY: only the address of the linker-placed symbol is read, never
    // its contents.
    unsafe { &trampoline_start as *const u8 as usize }
}

#[cfg(not(target_arch = "riscv64"))]
pub fn trampoline_phys() -> usize {
    unreachable!("trampoline_phys is only meaningful on riscv64gc-unknown-none-elf")
}

/// Install the kernel trap vector. Must run once per hart, before
/// interrupts are enabled.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    let vector = kernelvec as usize;
    // SAFETY: `stvec` only takes effect on the next trap; `vector` is a
    // valid code address for the lifetime of the kernel image. Mode bits
    // 00 (direct) are implied by a 4-byte-aligned address.
    unsafe {
        core::arch::asm!("csrw stvec, {}", in(reg) vector);
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub fn init() {
    unreachable!("trap::init is only meaningful on riscv64gc-unknown-none-elf")
}

/// Point `stvec` at the user trampoline before returning to user mode, and
/// back at `kernelvec` on the way back into the kernel. Called by the
/// scheduler around every process resume.
#[cfg(target_arch = "riscv64")]
pub fn set_user_trap_vector() {
    // SAFETY: TRAMPOLINE's low bits are always zero (page-aligned), so
    // this also selects direct mode.
    unsafe {
        core::arch::asm!("csrw stvec, {}", in(reg) TRAMPOLINE);
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub fn set_user_trap_vector() {
    unreachable!("set_user_trap_vector is only meaningful on riscv64gc-unknown-none-elf")
}

#[cfg(target_arch = "riscv64")]
pub fn set_kernel_trap_vector() {
    let vector = kernelvec as usize;
    // SAFETY: see `init`.
    unsafe {
        core::arch::asm!("csrw stvec, {}", in(reg) vector);
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub fn set_kernel_trap_vector() {
    unreachable!("set_kernel_trap_vector is only meaningful on riscv64gc-unknown-none-elf")
}

/// Fixed user-space virtual address of the trampoline's `uservec`/`userret`
/// pair, as mapped into every process's page table (identical physical
/// frame, so the `satp` switch inside these routines never faults).
pub fn trampoline_uservec_va() -> usize {
    TRAMPOLINE
}

pub fn trapframe_va() -> usize {
    TRAPFRAME
}

#[cfg(target_arch = "riscv64")]
fn scause() -> usize {
    let value: usize;
    // SAFETY: pure CSR read.
    unsafe { core::arch::asm!("csrr {}, scause", out(reg) value) };
    value
}

#[cfg(not(target_arch = "riscv64"))]
fn scause() -> usize {
    unreachable!("scause is only meaningful on riscv64gc-unknown-none-elf")
}

#[cfg(target_arch = "riscv64")]
fn stval() -> usize {
    let value: usize;
    // SAFETY: pure CSR read.
    unsafe { core::arch::asm!("csrr {}, stval", out(reg) value) };
    value
}

#[cfg(not(target_arch = "riscv64"))]
fn stval() -> usize {
    unreachable!("stval is only meaningful on riscv64gc-unknown-none-elf")
}

/// Called by `kernelvec` for a trap taken while the kernel itself was
/// running. The only expected cause is a timer interrupt; anything else
/// is a kernel invariant violation.
#[no_mangle]
extern "C" fn kernel_trap() {
    let cause = scause();
    if cause == SCAUSE_INTERRUPT | IRQ_S_TIMER {
        crate::arch::riscv64::timer::record_tick();
        clear_pending_timer();
    } else if cause == SCAUSE_INTERRUPT | IRQ_S_EXTERNAL {
        handle_external_interrupt();
    } else {
        crate::kpanic!("unexpected trap from kernel mode: scause=0x{cause:x}, stval=0x{:x}", stval());
    }
}

/// Called by `uservec` (through a small Rust shim installed as
/// `kernel_trap` in the trap frame) for a trap taken from a running
/// process: a syscall, a page fault, or a device/timer interrupt.
pub fn user_trap(frame: &mut TrapFrame) {
    let cause = scause();
    set_kernel_trap_vector();

    if cause == SCAUSE_INTERRUPT | IRQ_S_TIMER {
        crate::arch::riscv64::timer::record_tick();
        clear_pending_timer();
        crate::process::yield_cpu();
    } else if cause == SCAUSE_INTERRUPT | IRQ_S_EXTERNAL {
        handle_external_interrupt();
    } else if cause == EXC_ECALL_FROM_U {
        // Skip past the `ecall` instruction so re-entry resumes after it.
        frame.epc += 4;
        frame.a0 = crate::syscall::dispatch(frame) as usize;
    } else if matches!(
        cause,
        EXC_INSTRUCTION_PAGE_FAULT | EXC_LOAD_PAGE_FAULT | EXC_STORE_PAGE_FAULT
    ) {
        log::warn!("user page fault: scause={cause}, stval=0x{:x}", stval());
        crate::process::kill_current_with_fault();
    } else {
        log::warn!("unexpected user trap: scause=0x{cause:x}, stval=0x{:x}", stval());
        crate::process::kill_current_with_fault();
    }

    set_user_trap_vector();
}

fn handle_external_interrupt() {
    if let Some(irq) = crate::arch::plic::claim() {
        if irq == crate::config::virtio::IRQ {
            crate::drivers::virtio_blk::handle_interrupt();
        } else {
            log::warn!("unhandled external interrupt: irq={irq}");
        }
        let _ = crate::arch::plic::complete(irq);
    }
}

fn clear_pending_timer() {
    // Clearing the pending supervisor timer interrupt bit is done by
    // reprogramming the next comparator (sip.STIP is read-only and cleared
    // automatically once `set_timer` schedules a later deadline).
    crate::arch::timer::schedule_next_tick();
}
