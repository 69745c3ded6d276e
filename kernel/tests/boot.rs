//! Bare-metal boot smoke test: runs the real boot sequence up to (but not
//! including) the scheduler handoff, which never returns, and prints a
//! single pass/fail marker line a test harness can grep for in QEMU's
//! serial output.
//!
//! Not run on the host: this needs the riscv64gc-unknown-none-elf target,
//! QEMU's `virt` machine, and SBI firmware, none of which `cargo test`
//! without `--target` provides.

#![no_std]
#![no_main]

#[path = "../src/arch/riscv64/boot.rs"]
mod boot;

use sv39_kernel::{arch, config, drivers, fs, logger, mm, process};

#[no_mangle]
pub extern "C" fn rust_main() -> ! {
    logger::init();

    // SAFETY: the first and only call, before anything else touches the
    // frame allocator, the global allocator, or `satp`.
    unsafe {
        mm::init();
    }
    arch::init();
    drivers::virtio_blk::init();
    fs::init(config::ROOTDEV);
    process::init();

    log::info!("boot: every subsystem initialised without a fatal error");
    logger::console_putstr("BOOTOK\n");
    arch::halt();
}
