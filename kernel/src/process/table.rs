//! The fixed process pool, ready queue, and context switch (§4.4).
//!
//! Everything here runs under one rule: never call [`context::swtch`] while
//! holding [`POOL`]'s lock. The kernel is single-hart and cooperative (§5),
//! so nothing else can observe an inconsistent [`ProcessPool`] between a
//! bookkeeping update and the switch that follows it -- but the switch
//! suspends this call stack indefinitely, and the *next* thing that runs on
//! this hart (the scheduler loop, or another process) needs that same lock
//! back. Every function below locks, mutates, copies out the raw pointers
//! it needs, drops the lock, and only then calls `swtch`.

use spin::Mutex;

use crate::arch::riscv64::context::{self, Context};
use crate::arch::riscv64::trap::TrapFrame;
use crate::config::NPROC;
use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::mm::page_table;
use crate::sync::GlobalState;

use super::pcb::{Pcb, Pid, ProcessState};

struct ReadyQueue {
    slots: [usize; NPROC],
    head: usize,
    len: usize,
}

impl ReadyQueue {
    const fn empty() -> Self {
        Self { slots: [0; NPROC], head: 0, len: 0 }
    }

    fn push(&mut self, idx: usize) {
        let tail = (self.head + self.len) % NPROC;
        self.slots[tail] = idx;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let idx = self.slots[self.head];
        self.head = (self.head + 1) % NPROC;
        self.len -= 1;
        Some(idx)
    }
}

struct ProcessPool {
    procs: [Pcb; NPROC],
    ready: ReadyQueue,
    /// The scheduler loop's own saved context: the "one additional pseudo
    /// PCB representing the scheduler itself" (§4.4).
    idle_context: Context,
    /// Slot index of the process currently running on this hart, if any.
    current: Option<usize>,
    next_pid: Pid,
}

static POOL: GlobalState<Mutex<ProcessPool>> = GlobalState::new();

/// Reserve each slot's fixed kernel stack and trap-frame page once, up
/// front. Slots are reused across their `Unused -> ... -> Zombie -> Unused`
/// lifecycle; only the per-occupancy page table is allocated and freed on
/// every `allocate_process`/`exit`.
pub fn init() {
    let procs = core::array::from_fn(|_| {
        let kstack_frame = crate::mm::frame_allocator::alloc()
            .unwrap_or_else(|_| crate::kpanic!("process table: out of memory reserving kernel stacks"));
        let trapframe_frame = crate::mm::frame_allocator::alloc()
            .unwrap_or_else(|_| crate::kpanic!("process table: out of memory reserving trap frames"));
        Pcb::unused(kstack_frame.addr() + crate::config::PAGE_SIZE, trapframe_frame.addr())
    });

    let pool = ProcessPool {
        procs,
        ready: ReadyQueue::empty(),
        idle_context: Context::zeroed(),
        current: None,
        next_pid: 1,
    };
    if POOL.init(Mutex::new(pool)).is_err() {
        crate::kpanic!("process table: init called twice");
    }
}

pub(super) fn with_pool<R>(f: impl FnOnce(&mut ProcessPool) -> R) -> R {
    POOL.with(|mtx| f(&mut mtx.lock()))
        .unwrap_or_else(|| crate::kpanic!("process table used before init"))
}

impl ProcessPool {
    fn alloc_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }
}

/// Claim a free slot, give it a fresh page table (mapping only the
/// trampoline and trap-frame pages), and prime its context so the first
/// `swtch` into it lands in [`first_return`]. Returns the slot index; the
/// caller (the loader, or `fork`) still needs to populate the address
/// space and mark the slot `Runnable`.
pub(super) fn allocate_process() -> KernelResult<usize> {
    let (idx, trapframe_phys, kstack_top) = with_pool(|pool| {
        let idx = pool
            .procs
            .iter()
            .position(|p| p.state == ProcessState::Unused)
            .ok_or(KernelError::ProcessTableFull)?;
        let pid = pool.alloc_pid();
        let p = &mut pool.procs[idx];
        p.pid = pid;
        p.state = ProcessState::Used;
        Ok::<_, KernelError>((idx, p.trapframe_phys, p.kstack_top))
    })?;

    let pagetable = match page_table::create_user_pagetable(trapframe_phys) {
        Ok(pt) => pt,
        Err(e) => {
            with_pool(|pool| pool.procs[idx].reset_to_unused());
            return Err(e);
        }
    };

    with_pool(|pool| {
        let p = &mut pool.procs[idx];
        p.pagetable = Some(pagetable);
        p.context = Context::zeroed();
        p.context.ra = first_return as usize;
        p.context.sp = kstack_top;
    });

    Ok(idx)
}

/// Undo a partially-constructed slot (loader/fork failure path): free its
/// page table, if any, and return it to the pool.
pub(super) fn free_process(idx: usize) {
    let pagetable = with_pool(|pool| pool.procs[idx].pagetable.take());
    if let Some(pt) = pagetable {
        let max_vpn = with_pool(|pool| pool.procs[idx].max_vpn);
        let _ = page_table::free_pagetable(pt, max_vpn);
    }
    with_pool(|pool| pool.procs[idx].reset_to_unused());
}

pub(super) fn mark_runnable(idx: usize) {
    with_pool(|pool| {
        pool.procs[idx].state = ProcessState::Runnable;
        pool.ready.push(idx);
    });
}

pub(super) fn current_idx() -> usize {
    with_pool(|pool| pool.current.expect("no process is currently running on this hart"))
}

pub fn current_pid() -> Pid {
    with_pool(|pool| pool.procs[current_idx()].pid)
}

/// The scheduler loop (§4.4): repeatedly pop a runnable process and switch
/// into it. If the ready queue is ever empty, every process has exited or
/// blocked with nothing left to wake it, which on this single-hart kernel
/// is unrecoverable.
pub fn schedule() -> ! {
    loop {
        let (idle_ctx, new_ctx) = with_pool(|pool| {
            let idx = pool
                .ready
                .pop()
                .unwrap_or_else(|| crate::kpanic!("scheduler: no runnable process"));
            pool.procs[idx].state = ProcessState::Running;
            pool.current = Some(idx);
            (
                &mut pool.idle_context as *mut Context,
                &pool.procs[idx].context as *const Context,
            )
        });
        // SAFETY: `idle_ctx` and `new_ctx` point into the pool's 'static
        // storage; the lock above is already released.
        unsafe { context::swtch(idle_ctx, new_ctx) };
    }
}

/// Suspend the calling process and give the hart back to the scheduler,
/// without changing its state beyond `Runnable` -- used by a voluntary
/// yield (timer tick at the user/kernel boundary) and by busy-wait retry
/// loops (`wait`, virtio descriptor exhaustion).
pub fn yield_cpu() {
    let (old_ctx, idle_ctx) = with_pool(|pool| {
        let idx = pool.current.take().expect("yield_cpu with no current process");
        pool.procs[idx].state = ProcessState::Runnable;
        pool.ready.push(idx);
        (
            &mut pool.procs[idx].context as *mut Context,
            &pool.idle_context as *const Context,
        )
    });
    // SAFETY: see `schedule`.
    unsafe { context::swtch(old_ctx, idle_ctx) };
}

/// Block the calling process on `chan` until [`wakeup`] is called with the
/// same value.
pub fn sleep(chan: usize) {
    let (old_ctx, idle_ctx) = with_pool(|pool| {
        let idx = pool.current.take().expect("sleep with no current process");
        pool.procs[idx].state = ProcessState::Sleeping;
        pool.procs[idx].chan = chan;
        (
            &mut pool.procs[idx].context as *mut Context,
            &pool.idle_context as *const Context,
        )
    });
    // SAFETY: see `schedule`.
    unsafe { context::swtch(old_ctx, idle_ctx) };
}

/// Wake every process sleeping on `chan`.
pub fn wakeup(chan: usize) {
    with_pool(|pool| {
        for idx in 0..NPROC {
            if pool.procs[idx].state == ProcessState::Sleeping && pool.procs[idx].chan == chan {
                pool.procs[idx].state = ProcessState::Runnable;
                pool.procs[idx].chan = 0;
                pool.ready.push(idx);
            }
        }
    });
}

/// Tear down the calling process: close its files, release its address
/// space, reparent its children, and mark it a zombie for its parent's
/// `wait` to reap. Never returns -- there is no caller left to return to.
pub fn exit(code: i32) -> ! {
    let idx = current_idx();
    let pid = with_pool(|pool| pool.procs[idx].pid);

    for i in 0..crate::config::NOFILE {
        let handle = with_pool(|pool| pool.procs[idx].ofile[i].take());
        if let Some(h) = handle {
            fs::file::fileclose(h);
        }
    }

    let (pagetable, max_vpn) = with_pool(|pool| (pool.procs[idx].pagetable.take(), pool.procs[idx].max_vpn));
    if let Some(pt) = pagetable {
        let _ = page_table::free_pagetable(pt, max_vpn);
    }

    let (old_ctx, idle_ctx) = with_pool(|pool| {
        for p in pool.procs.iter_mut() {
            if p.parent == Some(pid) {
                p.parent = None;
            }
        }
        let p = &mut pool.procs[idx];
        p.exit_code = code;
        p.state = ProcessState::Zombie;
        pool.current = None;
        (
            &mut pool.procs[idx].context as *mut Context,
            &pool.idle_context as *const Context,
        )
    });
    // SAFETY: see `schedule`. This slot is never scheduled again until a
    // future `wait` reaps it and `allocate_process` reoccupies it, at
    // which point its context is reinitialised from scratch.
    unsafe { context::swtch(old_ctx, idle_ctx) };
    unreachable!("a zombie process was rescheduled");
}

/// Reap a zombie child of the calling process, per §4.4: repeatedly scan
/// for a matching child (any child if `target_pid == 0`); if one has
/// already exited, return its pid and exit code and free its slot; if
/// matching children exist but none has exited yet, yield and retry; if
/// none match at all, fail immediately.
pub fn wait(target_pid: Pid, out_code: &mut i32) -> i32 {
    let me = current_pid();
    loop {
        let outcome = with_pool(|pool| {
            let mut any_child = false;
            for idx in 0..NPROC {
                let matches_parent = pool.procs[idx].parent == Some(me)
                    && (target_pid == 0 || pool.procs[idx].pid == target_pid);
                if !matches_parent {
                    continue;
                }
                any_child = true;
                if pool.procs[idx].state == ProcessState::Zombie {
                    let pid = pool.procs[idx].pid;
                    let code = pool.procs[idx].exit_code;
                    pool.procs[idx].reset_to_unused();
                    return Some((pid as i32, code));
                }
            }
            if any_child {
                None
            } else {
                Some((-1, 0))
            }
        });
        match outcome {
            Some((-1, _)) => return -1,
            Some((pid, code)) => {
                *out_code = code;
                return pid;
            }
            None => yield_cpu(),
        }
    }
}

/// Kill the currently running process after a fault it cannot recover
/// from (§7): the kernel itself stays up, only this process is torn down.
pub fn kill_current_with_fault() -> ! {
    exit(-2)
}

#[cfg(target_arch = "riscv64")]
extern "C" {
    fn userret();
}

/// `trap_entry` is `#[no_mangle]`, so the linker always keeps it (and
/// everything it reaches, including this address-of) even in a host test
/// binary that never calls into it; a real `extern "C"` declaration with
/// no definition would fail to link on a host with no trampoline asm.
#[cfg(not(target_arch = "riscv64"))]
extern "C" fn userret() {
    unreachable!("userret is only meaningful on riscv64gc-unknown-none-elf")
}

const SSTATUS_SPP: usize = 1 << 8;
const SSTATUS_SPIE: usize = 1 << 5;

/// The shim `user_trap`'s doc comment refers to: installed as every
/// slot's `kernel_trap` trap-frame field, reached by a raw `jr` from
/// `uservec` with `a0` already holding the trap frame pointer. Dispatches
/// the trap through the architecture layer, then falls through to
/// [`return_to_user`], which never returns: the only way back into this
/// process's kernel stack is a future trap, not a function return.
#[no_mangle]
extern "C" fn trap_entry(frame: &mut TrapFrame) -> ! {
    crate::arch::riscv64::trap::user_trap(frame);
    return_to_user()
}

/// What a freshly allocated process's context first "returns" into via
/// `swtch`'s closing `ret` (§4.4, §4.5): there is no real caller on this
/// kernel stack, so, like `trap_entry`, this never returns either.
extern "C" fn first_return() -> ! {
    return_to_user()
}

/// Refresh the trap frame's four housekeeping fields, arm `sepc`/`sstatus`
/// for a `sret` into U-mode, and tail-call the trampoline's `userret` stub
/// at its fixed, identically-mapped virtual address -- so the `satp`
/// switch partway through `userret` never faults (§4.3).
fn return_to_user() -> ! {
    let (trapframe_ptr, satp) = with_pool(|pool| {
        let idx = pool.current.expect("return_to_user with no current process");
        let p = &mut pool.procs[idx];
        let tf = p.trapframe();
        // SAFETY: this slot's trap-frame page is exclusively owned by the
        // process currently assigned to it, and the kernel's own page
        // table identity-maps it.
        unsafe {
            (*tf).kernel_satp = crate::mm::kernel_satp();
            (*tf).kernel_sp = p.kstack_top;
            (*tf).kernel_trap = trap_entry as usize;
            (*tf).kernel_hartid = 0;
        }
        (tf, p.pagetable.expect("running process has no page table").satp())
    });

    let epc = unsafe { (*trapframe_ptr).epc };
    // SAFETY: CSR writes preparing the `sret` this function ends with.
    //
    // Gated to the real target: `return_to_user` is compiled for the host
    // too (it is reachable from `trap_entry`/`first_return`, which every
    // host-side unit test in this crate drags in transitively), but no
    // host test ever drives a process far enough to call it.
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("csrw sepc, {}", in(reg) epc);
        core::arch::asm!("csrc sstatus, {}", in(reg) SSTATUS_SPP);
        core::arch::asm!("csrs sstatus, {}", in(reg) SSTATUS_SPIE);
    }
    #[cfg(not(target_arch = "riscv64"))]
    let _ = epc;
    crate::arch::riscv64::trap::set_user_trap_vector();

    let trampoline_base = crate::arch::trampoline_phys();
    let offset = userret as usize - trampoline_base;
    let target = crate::config::TRAMPOLINE + offset;
    // SAFETY: `target` is `userret`'s entry point as mapped identically at
    // TRAMPOLINE in every address space; the calling convention matches
    // `userret`'s (a0 = trap frame, a1 = satp), and it never returns.
    let resume: extern "C" fn(usize, usize) -> ! = unsafe { core::mem::transmute(target) };
    resume(trapframe_ptr as usize, satp);
}
