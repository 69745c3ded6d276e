//! Loader (§4.5): the kernel's only path to getting a program running.
//!
//! Real user programs, the user-space library, and the host-side linker
//! arrangement that would produce them are explicitly out of scope (§1):
//! this kernel knows a fixed table of embedded images, baked into the
//! kernel binary itself, and copies one of them into a fresh address
//! space verbatim.

use crate::config::{PAGE_SIZE, USERBASE};
use crate::error::{KernelError, KernelResult};
use crate::mm::page_table::{self, PteFlags};

use super::table;

struct Image {
    name: &'static str,
    data: &'static [u8],
}

/// A minimal placeholder program: `addi a0, zero, 0` / `addi a7, zero,
/// SYS_EXIT` / `ecall` / an infinite self-jump in case `exit` ever
/// returned. Real userland programs are an external collaborator (§1);
/// this is the only image the loader's table needs to exercise `fork`,
/// `exec`, and `wait` end to end.
#[rustfmt::skip]
static INIT_IMAGE: [u8; 16] = [
    0x13, 0x05, 0x00, 0x00, // addi a0, zero, 0
    0x93, 0x08, 0x70, 0x00, // addi a7, zero, 7  (SYS_EXIT)
    0x73, 0x00, 0x00, 0x00, // ecall
    0x6f, 0x00, 0x00, 0x00, // 1: j 1b
];

static IMAGES: &[Image] = &[Image { name: "init", data: &INIT_IMAGE }];

fn find_image(name: &str) -> KernelResult<&'static Image> {
    IMAGES
        .iter()
        .find(|img| img.name == name)
        .ok_or(KernelError::NoSuchProgram)
}

/// Whether `name` names an image in the embedded table, without touching
/// any process state. Lets a caller (`exec`) validate before tearing
/// anything down.
pub fn exists(name: &str) -> bool {
    find_image(name).is_ok()
}

/// Map a single zeroed, freshly allocated frame at `va`, copying
/// `image[range]` into it (if any) and leaving the rest of the frame
/// zero. Frees the frame on a mapping failure.
fn map_image_page(
    root: page_table::PageTableRoot,
    va: usize,
    image: &[u8],
    range: core::ops::Range<usize>,
    perm: PteFlags,
) -> KernelResult<()> {
    let frame = crate::mm::frame_allocator::alloc()?;
    // SAFETY: `frame` was just allocated and is exclusively owned until
    // `map` below hands it to the page table.
    unsafe { core::ptr::write_bytes(frame.addr() as *mut u8, 0, PAGE_SIZE) };
    let copy_end = range.end.min(image.len());
    if range.start < copy_end {
        // SAFETY: `frame` is a freshly zeroed page; the slice length is
        // bounded by `copy_end - range.start <= PAGE_SIZE`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                image[range.start..copy_end].as_ptr(),
                frame.addr() as *mut u8,
                copy_end - range.start,
            );
        }
    }
    if let Err(e) = page_table::map(root, va, PAGE_SIZE, frame.addr(), perm) {
        crate::mm::frame_allocator::free(frame);
        return Err(e);
    }
    Ok(())
}

/// Load image `name` into process slot `idx`'s already-allocated (empty)
/// address space, per §4.5:
///
/// 1. Round the image's extent out to page boundaries.
/// 2. Map each page at the fixed user base, zero-filling the unused head
///    and tail bytes so no uninitialised kernel memory leaks to user
///    space.
/// 3. Map a user stack immediately above the image.
/// 4. Arm the trap frame's program counter and stack pointer.
/// 5. Initialise the heap just above the stack.
/// 6. Record the high-water mark of mapped pages.
///
/// On any failure, frames mapped so far are left in place; the caller
/// (process creation, or `exec`) is responsible for tearing down the
/// whole slot via [`table::free_process`].
pub fn load(idx: usize, name: &str) -> KernelResult<()> {
    let image = find_image(name)?;
    let root = table::with_pool(|pool| {
        pool.procs[idx]
            .pagetable
            .expect("loader::load on a slot with no page table")
    });

    let image_pages = image.data.len().div_ceil(PAGE_SIZE).max(1);
    for page in 0..image_pages {
        let va = USERBASE + page * PAGE_SIZE;
        let range = page * PAGE_SIZE..(page + 1) * PAGE_SIZE;
        map_image_page(
            root,
            va,
            image.data,
            range,
            PteFlags::USER | PteFlags::READ | PteFlags::WRITE | PteFlags::EXEC,
        )?;
    }

    let ustack_base = USERBASE + image_pages * PAGE_SIZE;
    map_image_page(root, ustack_base, &[], 0..0, PteFlags::USER | PteFlags::READ | PteFlags::WRITE)?;
    let ustack_top = ustack_base + PAGE_SIZE;

    table::with_pool(|pool| {
        let p = &mut pool.procs[idx];
        p.ustack_top = ustack_top;
        p.heap_bottom = ustack_top;
        p.heap_top = ustack_top;
        p.max_vpn = (ustack_top - USERBASE) / PAGE_SIZE;
        let tf = p.trapframe();
        // SAFETY: this slot's trap-frame page is exclusively owned by the
        // process being built here.
        unsafe {
            (*tf).epc = USERBASE;
            (*tf).sp = ustack_top;
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_image_name_is_recoverable() {
        assert!(matches!(find_image("does-not-exist"), Err(KernelError::NoSuchProgram)));
    }

    #[test]
    fn init_image_is_registered() {
        assert!(find_image("init").is_ok());
    }
}
