//! Sv39 page-table layer (§4.2).
//!
//! A page table is a tree of depth 3, each node a 4096-byte frame holding
//! 512 eight-byte entries. `walk` descends levels 2, 1, 0, selecting a
//! 9-bit index at shifts 30, 21, 12. An entry with `V` set and `R|W|X` all
//! clear is a pointer to the next level down; an entry with `V` set and
//! any of `R|W|X` set is a leaf.

use bitflags::bitflags;

use crate::config::{PAGE_SHIFT, PAGE_SIZE, PAGE_TABLE_ENTRIES};
use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator::{self, FrameNumber};

bitflags! {
    /// Sv39 PTE permission/status bits (RISC-V privileged spec §4.3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXEC     = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
    }
}

impl PteFlags {
    /// Whether this entry, if valid, is a leaf (maps a frame) rather than
    /// pointing at the next page-table level.
    pub fn is_leaf(self) -> bool {
        self.intersects(Self::READ | Self::WRITE | Self::EXEC)
    }
}

/// One 64-bit Sv39 page-table entry: PPN in bits 53:10, flags in bits 9:0.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    const PPN_SHIFT: u32 = 10;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0x3ff)
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    pub fn frame(self) -> FrameNumber {
        FrameNumber::new(self.0 >> Self::PPN_SHIFT)
    }

    pub fn set(&mut self, frame: FrameNumber, flags: PteFlags) {
        self.0 = (frame.as_u64() << Self::PPN_SHIFT) | (flags | PteFlags::VALID).bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// One level of an Sv39 page table: a 4096-byte frame of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    fn as_mut<'a>(frame: FrameNumber) -> &'a mut PageTable {
        // SAFETY: every frame reachable from a page-table root was
        // allocated by `alloc_table_frame` below, which zero-initializes a
        // full `PageTable`-sized, -aligned frame before handing it out.
        unsafe { &mut *(frame.addr() as *mut PageTable) }
    }
}

/// Root of one address space's page table.
#[derive(Debug, Clone, Copy)]
pub struct PageTableRoot(FrameNumber);

impl PageTableRoot {
    pub fn frame(self) -> FrameNumber {
        self.0
    }

    pub fn satp(self) -> usize {
        // Sv39 mode field (8) in bits 63:60, ASID 0, PPN in bits 43:0.
        (8usize << 60) | (self.0.as_u64() as usize)
    }
}

fn alloc_table_frame() -> KernelResult<FrameNumber> {
    let frame = frame_allocator::alloc()?;
    // SAFETY: `frame` was just allocated and is owned exclusively by this
    // call; zeroing it is required so every entry reads as invalid.
    unsafe { core::ptr::write_bytes(frame.addr() as *mut u8, 0, PAGE_SIZE) };
    Ok(frame)
}

fn vpn(va: usize, level: usize) -> usize {
    (va >> (PAGE_SHIFT + 9 * level)) & 0x1ff
}

/// Descend the three Sv39 levels for `va`, returning a pointer to the
/// level-0 (leaf) entry. If `create` is true, missing interior tables are
/// allocated and installed as encountered; if false, a missing interior
/// entry fails the walk.
pub fn walk(root: PageTableRoot, va: usize, create: bool) -> KernelResult<*mut PageTableEntry> {
    let mut table_frame = root.0;
    for level in (1..=2).rev() {
        let table = PageTable::as_mut(table_frame);
        let entry = &mut table.entries[vpn(va, level)];
        if entry.is_valid() {
            table_frame = entry.frame();
        } else {
            if !create {
                return Err(KernelError::UnmappedAddress { addr: va });
            }
            let child = alloc_table_frame()?;
            entry.set(child, PteFlags::empty());
            table_frame = child;
        }
    }
    let leaf_table = PageTable::as_mut(table_frame);
    Ok(&mut leaf_table.entries[vpn(va, 0)] as *mut PageTableEntry)
}

fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Map `len` bytes starting at `va` to physical frames starting at `pa`,
/// page by page, with permission bits `perm`. Fails (without undoing
/// earlier pages in this call) if any target leaf is already valid, or if
/// a page-table frame cannot be allocated.
pub fn map(root: PageTableRoot, va: usize, len: usize, pa: usize, perm: PteFlags) -> KernelResult<()> {
    let start = align_down(va);
    let end = align_down(va + len - 1);
    let mut v = start;
    let mut p = pa;
    loop {
        let pte = walk(root, v, true)?;
        // SAFETY: `walk` returns a pointer into a live page-table frame
        // owned by `root`.
        let entry = unsafe { &mut *pte };
        if entry.is_valid() {
            crate::kpanic!("page_table: remap of already-valid leaf at 0x{v:x}");
        }
        entry.set(FrameNumber::from_addr(p), perm);
        if v == end {
            break;
        }
        v += PAGE_SIZE;
        p += PAGE_SIZE;
    }
    Ok(())
}

/// Unmap `npages` pages starting at the page-aligned `va`. Absent entries
/// are skipped. A present entry that is not a leaf is a bug (fatal). When
/// `do_free` is set, the underlying physical frame is returned to the
/// frame allocator.
pub fn unmap(root: PageTableRoot, va: usize, npages: usize, do_free: bool) -> KernelResult<()> {
    if va % PAGE_SIZE != 0 {
        crate::kpanic!("page_table: unmap of unaligned address 0x{va:x}");
    }
    for i in 0..npages {
        let v = va + i * PAGE_SIZE;
        let pte = match walk(root, v, false) {
            Ok(pte) => pte,
            Err(_) => continue,
        };
        // SAFETY: see `map`.
        let entry = unsafe { &mut *pte };
        if !entry.is_valid() {
            continue;
        }
        if !entry.flags().is_leaf() {
            crate::kpanic!("page_table: unmap found non-leaf valid entry at 0x{v:x}");
        }
        if do_free {
            frame_allocator::free(entry.frame());
        }
        entry.clear();
    }
    Ok(())
}

/// Allocate a fresh root and map the shared trampoline and this process's
/// trap-frame page, neither user-accessible.
pub fn create_user_pagetable(trap_frame_phys: usize) -> KernelResult<PageTableRoot> {
    let root_frame = alloc_table_frame()?;
    let root = PageTableRoot(root_frame);
    map(
        root,
        crate::config::TRAMPOLINE,
        PAGE_SIZE,
        crate::arch::trampoline_phys(),
        PteFlags::READ | PteFlags::EXEC,
    )?;
    map(
        root,
        crate::config::TRAPFRAME,
        PAGE_SIZE,
        trap_frame_phys,
        PteFlags::READ | PteFlags::WRITE,
    )?;
    Ok(root)
}

/// Recursively free every interior page-table frame of `root` (not leaf
/// frames -- the caller unmaps user pages with release separately). A
/// valid leaf discovered during the interior walk is a bug.
pub fn free_pagetable(root: PageTableRoot, max_vpn: usize) -> KernelResult<()> {
    unmap(root, crate::config::USERBASE, max_vpn, true)?;
    unmap(root, crate::config::TRAMPOLINE, 1, false)?;
    unmap(root, crate::config::TRAPFRAME, 1, false)?;
    free_interior(root.frame(), 2);
    Ok(())
}

fn free_interior(table_frame: FrameNumber, level: usize) {
    let table = PageTable::as_mut(table_frame);
    for entry in table.entries.iter_mut() {
        if !entry.is_valid() {
            continue;
        }
        if entry.flags().is_leaf() {
            crate::kpanic!("page_table: valid leaf found during recursive free");
        }
        if level > 0 {
            free_interior(entry.frame(), level - 1);
        }
        entry.clear();
    }
    frame_allocator::free(table_frame);
}

/// Duplicate the user portion of `src` into `dst`: for every mapped page
/// below `max_vpn`, allocate a fresh frame in `dst`, copy the bytes, and
/// map it with the same permissions. On any failure, the partial prefix
/// already mapped into `dst` is unmapped with release before returning.
pub fn copy_user_pagetable(src: PageTableRoot, dst: PageTableRoot, max_vpn: usize) -> KernelResult<()> {
    let mut copied = 0usize;
    let result = (|| {
        let mut va = crate::config::USERBASE;
        let end = crate::config::USERBASE + max_vpn * PAGE_SIZE;
        while va < end {
            let pte = match walk(src, va, false) {
                Ok(pte) => pte,
                Err(_) => {
                    va += PAGE_SIZE;
                    continue;
                }
            };
            // SAFETY: see `map`.
            let entry = unsafe { &*pte };
            if !entry.is_valid() {
                va += PAGE_SIZE;
                continue;
            }
            let flags = entry.flags();
            let src_frame = entry.frame();
            let dst_frame = frame_allocator::alloc()?;
            // SAFETY: `src_frame` is a live mapped user page; `dst_frame`
            // was just allocated and is exclusively owned here.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src_frame.addr() as *const u8,
                    dst_frame.addr() as *mut u8,
                    PAGE_SIZE,
                );
            }
            map(dst, va, PAGE_SIZE, dst_frame.addr(), flags)?;
            copied += 1;
            va += PAGE_SIZE;
        }
        Ok(())
    })();
    if result.is_err() {
        let _ = unmap(dst, crate::config::USERBASE, copied, true);
    }
    result
}

/// Translate `va` to the kernel-accessible address of the byte within its
/// mapped frame, or an error if unmapped.
fn uva_to_kva(root: PageTableRoot, va: usize) -> KernelResult<usize> {
    let page_base = align_down(va);
    let pte = walk(root, page_base, false)?;
    // SAFETY: see `map`.
    let entry = unsafe { &*pte };
    if !entry.is_valid() {
        return Err(KernelError::UnmappedAddress { addr: va });
    }
    Ok(entry.frame().addr() + (va - page_base))
}

/// Copy `len` bytes from kernel memory `src` into user virtual memory at
/// `dst_va`, walking page by page so the copy is correct across a page
/// boundary.
pub fn copyout(root: PageTableRoot, dst_va: usize, src: &[u8]) -> KernelResult<()> {
    let mut va = dst_va;
    let mut done = 0usize;
    while done < src.len() {
        let page_base = align_down(va);
        let offset_in_page = va - page_base;
        let n = (PAGE_SIZE - offset_in_page).min(src.len() - done);
        let kva = uva_to_kva(root, va)?;
        // SAFETY: `kva` is the kernel-accessible address of a mapped user
        // frame, valid for at least `n` bytes since `n` never crosses the
        // page boundary computed above.
        unsafe {
            core::ptr::copy_nonoverlapping(src[done..].as_ptr(), kva as *mut u8, n);
        }
        done += n;
        va += n;
    }
    Ok(())
}

/// Copy `len` bytes from user virtual memory at `src_va` into kernel
/// memory `dst`.
pub fn copyin(root: PageTableRoot, src_va: usize, dst: &mut [u8]) -> KernelResult<()> {
    let mut va = src_va;
    let mut done = 0usize;
    while done < dst.len() {
        let page_base = align_down(va);
        let offset_in_page = va - page_base;
        let n = (PAGE_SIZE - offset_in_page).min(dst.len() - done);
        let kva = uva_to_kva(root, va)?;
        // SAFETY: see `copyout`.
        unsafe {
            core::ptr::copy_nonoverlapping(kva as *const u8, dst[done..].as_mut_ptr(), n);
        }
        done += n;
        va += n;
    }
    Ok(())
}

/// Copy a NUL-terminated string from user memory into `dst`, stopping at
/// the first NUL byte or when `dst` is full. Returns the length copied,
/// not including the terminator.
pub fn copyin_str(root: PageTableRoot, src_va: usize, dst: &mut [u8]) -> KernelResult<usize> {
    let mut va = src_va;
    let mut n = 0usize;
    while n < dst.len() {
        let kva = uva_to_kva(root, va)?;
        // SAFETY: `kva` addresses one mapped byte of user memory.
        let byte = unsafe { *(kva as *const u8) };
        if byte == 0 {
            return Ok(n);
        }
        dst[n] = byte;
        n += 1;
        va += 1;
    }
    Ok(n)
}

/// Grow a process's address space from `old` to `new` bytes: round `old`
/// up to a page and map a freshly allocated, zeroed frame for every page
/// in `[old, new)` with `U | perm`. On allocation failure, the
/// successfully mapped prefix is unmapped with release.
pub fn grow(root: PageTableRoot, old: usize, new: usize, perm: PteFlags) -> KernelResult<()> {
    if new <= old {
        return Ok(());
    }
    let start = align_up_addr(old);
    let mut mapped = 0usize;
    let mut va = start;
    let result = (|| {
        while va < new {
            let frame = frame_allocator::alloc()?;
            // SAFETY: freshly allocated frame, exclusively owned here.
            unsafe { core::ptr::write_bytes(frame.addr() as *mut u8, 0, PAGE_SIZE) };
            map(root, va, PAGE_SIZE, frame.addr(), PteFlags::USER | perm)?;
            mapped += 1;
            va += PAGE_SIZE;
        }
        Ok(())
    })();
    if result.is_err() {
        let _ = unmap(root, start, mapped, true);
    }
    result
}

/// Shrink a process's address space from `old` to `new` bytes: unmap
/// `[round_up(new), round_up(old))` with release.
pub fn shrink(root: PageTableRoot, old: usize, new: usize) -> KernelResult<()> {
    let new_top = align_up_addr(new);
    let old_top = align_up_addr(old);
    if new_top >= old_top {
        return Ok(());
    }
    let npages = (old_top - new_top) / PAGE_SIZE;
    unmap(root, new_top, npages, true)
}

fn align_up_addr(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Build the one kernel page table: an identity map over all of physical
/// RAM (so kernel code, the frame allocator's free list, and every
/// kernel-owned structure can be addressed by its physical address), plus
/// the PLIC and virtio-mmio device windows, plus the shared trampoline
/// page at the same fixed VA every user page table maps it at (so a
/// direct call into `userret` executes correctly across the `satp`
/// switch it performs).
pub fn build_kernel_pagetable() -> KernelResult<PageTableRoot> {
    use crate::config::{KERNBASE, PHYSTOP};

    extern "C" {
        static etext: u8;
    }
    // SAFETY: `etext` is a linker-provided boundary symbol; only its
    // address is read.
    let text_end = unsafe { &etext as *const u8 as usize };

    let root_frame = alloc_table_frame()?;
    let root = PageTableRoot(root_frame);

    map(root, KERNBASE, text_end - KERNBASE, KERNBASE, PteFlags::READ | PteFlags::EXEC)?;
    map(
        root,
        text_end,
        PHYSTOP - text_end,
        text_end,
        PteFlags::READ | PteFlags::WRITE,
    )?;
    map(
        root,
        crate::config::plic::BASE,
        PAGE_SIZE * 0x400,
        crate::config::plic::BASE,
        PteFlags::READ | PteFlags::WRITE,
    )?;
    map(
        root,
        crate::config::virtio::MMIO_BASE,
        PAGE_SIZE,
        crate::config::virtio::MMIO_BASE,
        PteFlags::READ | PteFlags::WRITE,
    )?;
    map(
        root,
        crate::config::TRAMPOLINE,
        PAGE_SIZE,
        crate::arch::trampoline_phys(),
        PteFlags::READ | PteFlags::EXEC,
    )?;
    Ok(root)
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use super::*;
    use crate::mm::frame_allocator as falloc;

    fn with_test_heap(pages: usize) {
        crate::mm::heap::init_for_test();
        let backing: Vec<u8> = alloc::vec![0u8; (pages + 2) * PAGE_SIZE];
        let base = backing.as_ptr() as usize;
        let start = (base + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = start + pages * PAGE_SIZE;
        falloc::test_reinit(start, end);
        core::mem::forget(backing);
    }

    fn fresh_root() -> PageTableRoot {
        let root_frame = falloc::alloc().unwrap();
        // SAFETY: freshly allocated frame, exclusively owned here.
        unsafe { core::ptr::write_bytes(root_frame.addr() as *mut u8, 0, PAGE_SIZE) };
        PageTableRoot(root_frame)
    }

    #[test]
    fn map_unmap_round_trip() {
        with_test_heap(64);
        let root = fresh_root();

        let data_frame = falloc::alloc().unwrap();
        let va = 0x1000usize;
        map(root, va, PAGE_SIZE, data_frame.addr(), PteFlags::READ | PteFlags::WRITE).unwrap();

        let pte = walk(root, va, false).unwrap();
        assert!(unsafe { (*pte).is_valid() });

        unmap(root, va, 1, true).unwrap();
        assert!(walk(root, va, false).is_err());
    }

    #[test]
    fn copyout_copyin_cross_page() {
        with_test_heap(64);
        let root = fresh_root();

        for i in 0..2 {
            let frame = falloc::alloc().unwrap();
            map(
                root,
                i * PAGE_SIZE,
                PAGE_SIZE,
                frame.addr(),
                PteFlags::READ | PteFlags::WRITE,
            )
            .unwrap();
        }

        let va = PAGE_SIZE - 8;
        let src: Vec<u8> = (0..16u8).collect();
        copyout(root, va, &src).unwrap();
        let mut dst = [0u8; 16];
        copyin(root, va, &mut dst).unwrap();
        assert_eq!(&dst[..], &src[..]);
    }
}
