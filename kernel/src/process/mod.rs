//! Process management (§3, §4.4, §4.5): the fixed PCB pool, the
//! scheduler and context switch, `fork`, and the embedded-image loader.

pub mod fork;
pub mod loader;
pub mod pcb;
pub mod table;

pub use fork::fork;
pub use pcb::{Pcb, Pid, ProcessState};
pub use table::{current_pid, exit, kill_current_with_fault, schedule, sleep, wait, wakeup, yield_cpu};

use crate::config::{NOFILE, USERBASE};
use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::mm::page_table;

/// Bring up process management: the fixed PCB pool, then the first
/// process (pid 1), loaded from the loader's `"init"` image with
/// descriptors 0/1/2 wired to the console. Left `Runnable`; the caller
/// enters [`table::schedule`] once every other subsystem is up.
pub fn init() {
    table::init();

    let idx = table::allocate_process().unwrap_or_else(|e| crate::kpanic!("process::init: {e}"));
    loader::load(idx, "init").unwrap_or_else(|e| crate::kpanic!("process::init: failed to load init image: {e}"));

    let stdin = fs::file::fileopen_stdio(true, false).unwrap_or_else(|e| crate::kpanic!("process::init: {e}"));
    let stdout = fs::file::fileopen_stdio(false, true).unwrap_or_else(|e| crate::kpanic!("process::init: {e}"));
    let stderr = fs::file::fileopen_stdio(false, true).unwrap_or_else(|e| crate::kpanic!("process::init: {e}"));
    table::with_pool(|pool| {
        let p = &mut pool.procs[idx];
        p.ofile[0] = Some(stdin);
        p.ofile[1] = Some(stdout);
        p.ofile[2] = Some(stderr);
    });

    table::mark_runnable(idx);
    log::info!("process: started init (pid 1)");
}

/// `exec(name)` (§4.4): look up `name` in the loader's embedded-image
/// table, release the calling process's current user mapping, and load
/// the named image into the same slot -- same pid, same open files,
/// fresh address space. On failure (most commonly an unknown image
/// name) the caller keeps running its old image, matching the POSIX
/// `execve` failure contract.
pub fn exec(name: &str) -> KernelResult<()> {
    if !loader::exists(name) {
        return Err(KernelError::NoSuchProgram);
    }
    let idx = table::current_idx();
    let (root, max_vpn) = table::with_pool(|pool| {
        let p = &pool.procs[idx];
        (p.pagetable.expect("exec on a process with no page table"), p.max_vpn)
    });

    if max_vpn > 0 {
        page_table::unmap(root, USERBASE, max_vpn, true)?;
    }
    table::with_pool(|pool| {
        let p = &mut pool.procs[idx];
        p.ustack_top = 0;
        p.heap_bottom = 0;
        p.heap_top = 0;
        p.max_vpn = 0;
    });

    loader::load(idx, name)
}

/// `sbrk(delta)` (§6): grow or shrink the calling process's heap by
/// `delta` bytes (negative shrinks), returning the *old* break, per the
/// traditional Unix `sbrk` contract. Rejects a shrink that would move
/// the break below `heap_bottom` (§9 open question: treated as an error
/// rather than clamped, since the source's silent-clamp behaviour would
/// hide a caller bug).
pub fn sbrk(delta: isize) -> KernelResult<usize> {
    use crate::mm::page_table::PteFlags;

    let idx = table::current_idx();
    let (root, old_top, heap_bottom) = table::with_pool(|pool| {
        let p = &pool.procs[idx];
        (p.pagetable.expect("sbrk on a process with no page table"), p.heap_top, p.heap_bottom)
    });

    let new_top = if delta >= 0 {
        old_top.checked_add(delta as usize).ok_or(KernelError::InvalidBreak)?
    } else {
        old_top.checked_sub(delta.unsigned_abs()).ok_or(KernelError::InvalidBreak)?
    };
    if new_top < heap_bottom {
        return Err(KernelError::InvalidBreak);
    }

    if new_top > old_top {
        page_table::grow(root, old_top, new_top, PteFlags::READ | PteFlags::WRITE)?;
    } else if new_top < old_top {
        page_table::shrink(root, old_top, new_top)?;
    }

    table::with_pool(|pool| {
        let p = &mut pool.procs[idx];
        p.heap_top = new_top;
        p.max_vpn = (align_up(new_top) - USERBASE) / crate::config::PAGE_SIZE;
    });
    Ok(old_top)
}

fn align_up(addr: usize) -> usize {
    (addr + crate::config::PAGE_SIZE - 1) & !(crate::config::PAGE_SIZE - 1)
}

/// Look up the calling process's open-file handle for descriptor `fd`.
pub fn current_file(fd: usize) -> KernelResult<fs::FileHandle> {
    if fd >= NOFILE {
        return Err(KernelError::BadFileDescriptor);
    }
    let idx = table::current_idx();
    table::with_pool(|pool| pool.procs[idx].ofile[fd]).ok_or(KernelError::BadFileDescriptor)
}

/// Install `handle` as the calling process's lowest-numbered free
/// descriptor, used by `open`.
pub fn install_fd(handle: fs::FileHandle) -> KernelResult<usize> {
    let idx = table::current_idx();
    table::with_pool(|pool| {
        let p = &mut pool.procs[idx];
        for (fd, slot) in p.ofile.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(fd);
            }
        }
        Err(KernelError::BadFileDescriptor)
    })
}

/// Drop the calling process's descriptor `fd`, closing the underlying
/// file entry if this was the last reference.
pub fn close_fd(fd: usize) -> KernelResult<()> {
    if fd >= NOFILE {
        return Err(KernelError::BadFileDescriptor);
    }
    let idx = table::current_idx();
    let handle = table::with_pool(|pool| pool.procs[idx].ofile[fd].take());
    match handle {
        Some(h) => {
            fs::file::fileclose(h);
            Ok(())
        }
        None => Err(KernelError::BadFileDescriptor),
    }
}

/// The calling process's page table, for syscalls that need to
/// copy to/from user memory (`copyin`/`copyout`/`copyin_str`).
pub fn current_pagetable() -> page_table::PageTableRoot {
    let idx = table::current_idx();
    table::with_pool(|pool| pool.procs[idx].pagetable.expect("running process has no page table"))
}

/// `fork()` (§4.4): clone the calling process.
pub fn fork_current() -> KernelResult<Pid> {
    fork(table::current_idx())
}

/// Allocate the lowest-numbered free descriptor for `path` opened under
/// `mode` (§4.9, §6): the `open` syscall's glue between the file system
/// and the per-process descriptor table.
pub fn open(path: &str, mode: u32) -> KernelResult<usize> {
    let handle = fs::file::fileopen(path, mode)?;
    match install_fd(handle) {
        Ok(fd) => Ok(fd),
        Err(e) => {
            fs::file::fileclose(handle);
            Err(e)
        }
    }
}
