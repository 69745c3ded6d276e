//! Kernel entry point. QEMU's `virt` machine loads this image at
//! `KERNBASE` and jumps to `_start` in S-mode with an undefined stack
//! pointer and no virtual memory yet enabled; `_start` (in `boot`, shared
//! verbatim with the bare-metal integration tests under `tests/`) points
//! `sp` at a static stack and falls into [`rust_main`].

#![no_std]
#![no_main]

#[path = "arch/riscv64/boot.rs"]
mod boot;

use sv39_kernel::{bootstrap, logger};

/// Git commit and build timestamp baked in by `build.rs`, logged once at
/// boot so a serial capture can be tied back to the exact image that
/// produced it.
const GIT_HASH: &str = env!("GIT_HASH");
const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");

#[no_mangle]
pub extern "C" fn rust_main() -> ! {
    logger::init();
    log::info!("sv39-kernel booting (commit {GIT_HASH}, built @{BUILD_TIMESTAMP})");
    bootstrap::run();
}
