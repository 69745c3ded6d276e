//! Kernel heap.
//!
//! Fixed pools hold every long-lived kernel object (process table, block
//! cache, inode cache); the heap exists only for incidental `alloc` use --
//! short-lived `Vec`/`Box`/`String` values inside otherwise fixed-size
//! subsystems -- so a single static backing array handed to
//! `linked_list_allocator` is enough.

use linked_list_allocator::LockedHeap;

/// Kernel heap size.
pub const HEAP_SIZE: usize = 1024 * 1024;

static mut HEAP_MEMORY: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the static backing array to the allocator. Must run exactly once,
/// before any `alloc`/`Box`/`Vec` use.
///
/// # Safety
/// Must not be called more than once, and no other code may reference
/// `HEAP_MEMORY` concurrently with this call.
pub unsafe fn init() {
    // SAFETY: `HEAP_MEMORY` is accessed exactly once here, before any
    // allocation can take a reference into it.
    unsafe {
        let start = core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut u8;
        ALLOCATOR.lock().init(start, HEAP_SIZE);
    }
}

/// Host-side unit tests across this crate reach for `Vec`/`vec!` to build
/// throwaway backing buffers, but nothing boots a host test through
/// [`crate::mm::init`] to hand the global allocator its arena first. Every
/// test module that needs `alloc` calls this once (idempotently) before
/// its first allocation instead.
#[cfg(any(test, feature = "testing"))]
pub fn init_for_test() {
    use spin::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        // SAFETY: guarded by `Once`, so this runs at most one time across
        // the whole test binary.
        unsafe { init() };
    });
}
