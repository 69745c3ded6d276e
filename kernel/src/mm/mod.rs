//! Memory management: physical frames (§4.1) and Sv39 page tables (§4.2).

pub mod frame_allocator;
pub mod heap;
pub mod page_table;

use spin::Mutex;

use crate::sync::GlobalState;

pub use frame_allocator::FrameNumber;
pub use page_table::{PageTableEntry, PageTableRoot, PteFlags};

static KERNEL_PAGETABLE: GlobalState<Mutex<PageTableRoot>> = GlobalState::new();

/// Bring up physical memory management: the frame allocator over every
/// page past the kernel image, the kernel heap used for incidental
/// `alloc` needs (`Vec`/`Box` inside otherwise fixed-pool subsystems), and
/// the one kernel page table every trap reloads `satp` to.
///
/// # Safety
/// Must run exactly once, early in boot, before any other subsystem calls
/// [`frame_allocator::alloc`], uses the global allocator, or reads
/// [`kernel_satp`].
pub unsafe fn init() {
    // SAFETY: delegated to the caller's contract above; `kernel_end` and
    // `PHYSTOP` bound the only RAM range not already occupied by the
    // kernel image.
    unsafe {
        extern "C" {
            static kernel_end: u8;
        }
        let end = &kernel_end as *const u8 as usize;
        frame_allocator::init(end, crate::config::PHYSTOP);
        heap::init();
    }
    let root = page_table::build_kernel_pagetable()
        .unwrap_or_else(|e| crate::kpanic!("failed to build kernel page table: {e}"));
    if KERNEL_PAGETABLE.init(Mutex::new(root)).is_err() {
        crate::kpanic!("mm::init called twice");
    }
    // SAFETY: `root` identity-maps all of RAM, so switching to it changes
    // no address the kernel is currently using.
    //
    // Gated to the real target: this function is compiled for the host
    // too (host-side unit tests live throughout this crate), and it is
    // never actually called outside a real boot sequence.
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("csrw satp, {}", "sfence.vma zero, zero", in(reg) root.satp());
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = root.satp();
    }
}

/// `satp` value for the kernel's own page table, reloaded by the trap
/// vectors on every entry from user mode.
pub fn kernel_satp() -> usize {
    KERNEL_PAGETABLE
        .with(|root| root.lock().satp())
        .unwrap_or_else(|| crate::kpanic!("kernel page table used before mm::init"))
}
