//! `fork`: duplicate the calling process into a new, independent one
//! (§4.4).

use crate::arch::riscv64::trap::TrapFrame;
use crate::config::NOFILE;
use crate::error::KernelResult;
use crate::fs;
use crate::mm::page_table;

use super::pcb::{Pid, ProcessState};
use super::table;

/// Clone the calling process (`parent_idx`): a fresh page table carrying a
/// copy of every mapped user page, a copy of the trap frame with the
/// syscall return value forced to zero (the child's view of `fork`'s
/// result), duplicated open-file references, and the same parent link
/// recorded against the new child's pid. The child is left `Runnable` on
/// success; on any failure the partially built slot is torn down and the
/// parent is charged nothing.
pub fn fork(parent_idx: usize) -> KernelResult<Pid> {
    let child_idx = table::allocate_process()?;

    let attempt: KernelResult<()> = (|| {
        let (parent_pt, parent_max_vpn, parent_trapframe_phys, heap_bottom, heap_top, parent_pid, ofile) =
            table::with_pool(|pool| {
                let p = &pool.procs[parent_idx];
                (
                    p.pagetable.expect("forking process has no page table"),
                    p.max_vpn,
                    p.trapframe_phys,
                    p.heap_bottom,
                    p.heap_top,
                    p.pid,
                    p.ofile,
                )
            });
        let child_pt = table::with_pool(|pool| {
            pool.procs[child_idx]
                .pagetable
                .expect("freshly allocated process has no page table")
        });

        page_table::copy_user_pagetable(parent_pt, child_pt, parent_max_vpn)?;

        let child_trapframe_phys = table::with_pool(|pool| pool.procs[child_idx].trapframe_phys);
        // SAFETY: both trap-frame pages are kernel-identity-mapped and
        // exclusively owned by their slots while neither process is
        // running.
        unsafe {
            core::ptr::copy_nonoverlapping(
                parent_trapframe_phys as *const u8,
                child_trapframe_phys as *mut u8,
                core::mem::size_of::<TrapFrame>(),
            );
            (*(child_trapframe_phys as *mut TrapFrame)).a0 = 0;
        }

        let mut duped: [Option<fs::FileHandle>; NOFILE] = [None; NOFILE];
        for (slot, src) in duped.iter_mut().zip(ofile.iter()) {
            *slot = src.map(|h| fs::file::filedup(h));
        }

        table::with_pool(|pool| {
            let child = &mut pool.procs[child_idx];
            child.max_vpn = parent_max_vpn;
            child.heap_bottom = heap_bottom;
            child.heap_top = heap_top;
            child.ustack_top = pool.procs[parent_idx].ustack_top;
            child.parent = Some(parent_pid);
            child.ofile = duped;
        });
        Ok(())
    })();

    match attempt {
        Ok(()) => {
            let child_pid = table::with_pool(|pool| pool.procs[child_idx].pid);
            table::with_pool(|pool| pool.procs[child_idx].state = ProcessState::Used);
            table::mark_runnable(child_idx);
            Ok(child_pid)
        }
        Err(e) => {
            table::free_process(child_idx);
            Err(e)
        }
    }
}
