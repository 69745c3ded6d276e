//! Process control block (§3, §4.4).
//!
//! A PCB is never heap-allocated: the fixed pool in [`super::table`] holds
//! `NPROC` of these inline, and a process's identity *is* its slot index
//! for the lifetime of one occupancy (`Unused` -> ... -> `Zombie` ->
//! `Unused`). The kernel stack and trap-frame physical pages are likewise
//! reserved once per slot at boot and simply reused across occupancies,
//! following the same "fixed pool, no allocation on the hot path" rule
//! the PCB pool itself follows.

use crate::arch::riscv64::context::Context;
use crate::arch::riscv64::trap::TrapFrame;
use crate::config::NOFILE;
use crate::fs::FileHandle;
use crate::mm::page_table::PageTableRoot;

/// A process's process identifier. Zero is never assigned to a live
/// process; it is used as the "no parent" sentinel.
pub type Pid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// One process control block.
pub struct Pcb {
    pub state: ProcessState,
    pub pid: Pid,
    /// `None` only while `state == Unused`.
    pub pagetable: Option<PageTableRoot>,
    /// Fixed per-slot kernel stack, reserved once at [`super::table::init`].
    pub kstack_top: usize,
    pub ustack_top: usize,
    /// Fixed per-slot trap-frame physical page, reserved once at
    /// [`super::table::init`].
    pub trapframe_phys: usize,
    /// Saved kernel context; restored by `swtch` when this process is
    /// dispatched.
    pub context: Context,
    /// High watermark of mapped user pages, so `exit`/`fork` know exactly
    /// how much of the address space to unmap/duplicate.
    pub max_vpn: usize,
    pub heap_bottom: usize,
    pub heap_top: usize,
    /// Weak reference: identity only, never an owning pointer. `None` for
    /// the init process and for any process whose parent has already
    /// exited (reparented to `None`, per §4.4's `exit`).
    pub parent: Option<Pid>,
    pub exit_code: i32,
    /// A nonzero sleep channel the process is blocked on; `0` when not
    /// sleeping. An address-sized token rather than a type, following the
    /// same "sleep on a pointer" idiom this scheduler design is grounded
    /// in.
    pub chan: usize,
    pub ofile: [Option<FileHandle>; NOFILE],
}

impl Pcb {
    pub const fn unused(kstack_top: usize, trapframe_phys: usize) -> Self {
        Self {
            state: ProcessState::Unused,
            pid: 0,
            pagetable: None,
            kstack_top,
            ustack_top: 0,
            trapframe_phys,
            context: Context::zeroed(),
            max_vpn: 0,
            heap_bottom: 0,
            heap_top: 0,
            parent: None,
            exit_code: 0,
            chan: 0,
            ofile: [None; NOFILE],
        }
    }

    /// Kernel-virtual pointer to this slot's trap frame. Valid because the
    /// kernel page table identity-maps all of RAM (§9).
    pub fn trapframe(&self) -> *mut TrapFrame {
        self.trapframe_phys as *mut TrapFrame
    }

    /// Return a reaped slot to `Unused`, keeping the fixed per-slot kernel
    /// stack and trap-frame page so the slot can be reoccupied without
    /// reallocating either.
    pub fn reset_to_unused(&mut self) {
        self.state = ProcessState::Unused;
        self.pid = 0;
        self.pagetable = None;
        self.ustack_top = 0;
        self.context = Context::zeroed();
        self.max_vpn = 0;
        self.heap_bottom = 0;
        self.heap_top = 0;
        self.parent = None;
        self.exit_code = 0;
        self.chan = 0;
        self.ofile = [None; NOFILE];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_to_unused_keeps_fixed_slot_fields_but_clears_occupancy() {
        let mut p = Pcb::unused(0x1000, 0x2000);
        p.state = ProcessState::Running;
        p.pid = 7;
        p.max_vpn = 42;
        p.heap_top = 0x8050_0000;
        p.parent = Some(3);
        p.exit_code = -2;
        p.chan = 0x9000;

        p.reset_to_unused();

        assert_eq!(p.state, ProcessState::Unused);
        assert_eq!(p.pid, 0);
        assert_eq!(p.max_vpn, 0);
        assert_eq!(p.heap_top, 0);
        assert_eq!(p.parent, None);
        assert_eq!(p.exit_code, 0);
        assert_eq!(p.chan, 0);
        // The per-slot pages reserved once at boot survive every reoccupancy.
        assert_eq!(p.kstack_top, 0x1000);
        assert_eq!(p.trapframe_phys, 0x2000);
    }
}
