//! Boot sequencing (§9): the fixed order every subsystem must come up in,
//! from the first instruction after SBI hands off control to the point the
//! scheduler starts running `init`.
//!
//! 1. Frame allocator and kernel page table ([`mm::init`]) -- every later
//!    stage needs to allocate physical frames or address kernel memory by
//!    its physical address.
//! 2. SBI diagnostics, PLIC reset, trap vectors, timer ([`arch::init`]).
//! 3. The virtio-mmio block driver ([`drivers::virtio_blk::init`]) -- the
//!    file system needs a working block device before it can read the
//!    superblock.
//! 4. The file system ([`fs::init`]): block cache, superblock, inode
//!    table, open-file table, in that order.
//! 5. Process management ([`process::init`]): the fixed PCB pool, then the
//!    first process (pid 1, the embedded `"init"` image) wired to the
//!    console on fds 0/1/2 and marked runnable.
//! 6. [`process::schedule`], which never returns.

use crate::{arch, drivers, fs, mm, process};

/// Run the boot sequence and hand control to the scheduler.
///
/// # Panics
/// Any failure here is unrecoverable: there is no subsystem left to report
/// a boot failure to. Each stage panics (via [`crate::kpanic`] or an
/// `unwrap_or_else`) with a message identifying what failed.
pub fn run() -> ! {
    // SAFETY: this is the first and only call, made before any other code
    // allocates a frame, uses the global allocator, or reads the kernel
    // page table's `satp` value.
    unsafe {
        mm::init();
    }
    log::info!("bootstrap: memory management initialised");

    arch::init();
    log::info!("bootstrap: trap vectors and timer initialised");

    drivers::virtio_blk::init();

    fs::init(crate::config::ROOTDEV);
    log::info!("bootstrap: file system mounted");

    process::init();

    // Interrupts stay off until the first `swtch` lands in `return_to_user`,
    // which arms `sstatus.SPIE` for the `sret` into pid 1: nothing is
    // running yet to receive a timer tick or virtio completion safely.
    process::schedule();
}
