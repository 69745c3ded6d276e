//! System-call dispatch (§6): the trap handler's only door into the rest
//! of the kernel for a user-mode process.
//!
//! `dispatch` is called once per `ecall` trap with the full trap frame;
//! `a7` names the call, `a0`-`a5` carry arguments, and the return value
//! (placed in `a0` by the caller) collapses every [`KernelError`] to a
//! small negative `isize` per §7.

use crate::arch::riscv64::trap::TrapFrame;
use crate::config::BSIZE;
use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::mm::page_table;
use crate::process;

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Syscall {
    Write = 1,
    Read = 2,
    Open = 3,
    Close = 4,
    Yield = 5,
    GetTime = 6,
    // `7` matches the `a7` value hard-coded into the loader's embedded
    // "init" image (§4.5) -- there is no assembler here to keep a symbolic
    // constant in sync, so this discriminant is load-bearing.
    Exit = 7,
    Fork = 8,
    Exec = 9,
    Wait = 10,
    Sbrk = 11,
}

impl Syscall {
    fn from_a7(value: usize) -> Option<Self> {
        Some(match value {
            1 => Self::Write,
            2 => Self::Read,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Yield,
            6 => Self::GetTime,
            7 => Self::Exit,
            8 => Self::Fork,
            9 => Self::Exec,
            10 => Self::Wait,
            11 => Self::Sbrk,
            _ => return None,
        })
    }
}

/// Longest path or image name the kernel will copy in from user memory in
/// one call. Generous for a single flat directory of short names.
const MAX_NAME: usize = 64;

fn err_code(e: KernelError) -> isize {
    use KernelError::*;
    let code = match e {
        FileNotFound | NoSuchProgram | NoSuchChild => 2,
        BadFileDescriptor => 9,
        NameExists => 17,
        NotAFile => 21,
        FileTooLarge => 27,
        InvalidBreak | InvalidArgument { .. } => 22,
        OutOfMemory | PageTableAlloc | ProcessTableFull | FileTableFull => 12,
        UnmappedAddress { .. } | Unaligned { .. } => 14,
    };
    -code
}

fn copyin_name(root: page_table::PageTableRoot, va: usize) -> KernelResult<[u8; MAX_NAME]> {
    let mut buf = [0u8; MAX_NAME];
    page_table::copyin_str(root, va, &mut buf)?;
    Ok(buf)
}

fn name_str(buf: &[u8; MAX_NAME]) -> &str {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    core::str::from_utf8(&buf[..len]).unwrap_or("")
}

/// Dispatch one `ecall` trap. Returns the value to place in the trap
/// frame's `a0` on return to user mode.
pub fn dispatch(frame: &mut TrapFrame) -> isize {
    let call = match Syscall::from_a7(frame.a7) {
        Some(c) => c,
        None => return -1,
    };

    let result = match call {
        Syscall::Write => sys_write(frame.a0, frame.a1, frame.a2),
        Syscall::Read => sys_read(frame.a0, frame.a1, frame.a2),
        Syscall::Open => sys_open(frame.a0, frame.a1 as u32),
        Syscall::Close => sys_close(frame.a0),
        Syscall::Exit => sys_exit(frame.a0 as i32),
        Syscall::Yield => sys_yield(),
        Syscall::GetTime => sys_get_time(),
        Syscall::Fork => sys_fork(),
        Syscall::Exec => sys_exec(frame.a0),
        Syscall::Wait => sys_wait(frame.a0 as isize, frame.a1),
        Syscall::Sbrk => sys_sbrk(frame.a0 as isize),
    };

    match result {
        Ok(value) => value as isize,
        Err(e) => err_code(e),
    }
}

fn sys_write(fd: usize, buf: usize, len: usize) -> KernelResult<usize> {
    let handle = process::current_file(fd)?;
    let root = process::current_pagetable();
    fs::file::inodewrite(handle, root, buf, len).map(|n| n as usize)
}

fn sys_read(fd: usize, buf: usize, len: usize) -> KernelResult<usize> {
    let handle = process::current_file(fd)?;
    let root = process::current_pagetable();
    fs::file::inoderead(handle, root, buf, len).map(|n| n as usize)
}

fn sys_open(path_va: usize, mode: u32) -> KernelResult<usize> {
    let root = process::current_pagetable();
    let name = copyin_name(root, path_va)?;
    process::open(name_str(&name), mode)
}

fn sys_close(fd: usize) -> KernelResult<usize> {
    process::close_fd(fd)?;
    Ok(0)
}

fn sys_exit(code: i32) -> KernelResult<usize> {
    process::exit(code);
}

fn sys_yield() -> KernelResult<usize> {
    process::yield_cpu();
    Ok(0)
}

fn sys_get_time() -> KernelResult<usize> {
    Ok(crate::arch::riscv64::timer::ticks() as usize)
}

fn sys_fork() -> KernelResult<usize> {
    process::fork_current().map(|pid| pid as usize)
}

fn sys_exec(name_va: usize) -> KernelResult<usize> {
    let root = process::current_pagetable();
    let name = copyin_name(root, name_va)?;
    process::exec(name_str(&name))?;
    Ok(0)
}

fn sys_wait(pid: isize, code_va: usize) -> KernelResult<usize> {
    let target = if pid <= 0 { 0 } else { pid as u32 };
    let mut code = 0i32;
    let result = process::wait(target, &mut code);
    if result >= 0 && code_va != 0 {
        let root = process::current_pagetable();
        page_table::copyout(root, code_va, &code.to_ne_bytes())?;
    }
    Ok(result as usize)
}

fn sys_sbrk(delta: isize) -> KernelResult<usize> {
    process::sbrk(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscall_number_is_rejected() {
        assert!(Syscall::from_a7(999).is_none());
    }

    #[test]
    fn bad_file_descriptor_maps_to_negative_nine() {
        assert_eq!(err_code(KernelError::BadFileDescriptor), -9);
    }

    #[test]
    fn name_str_stops_at_first_nul() {
        let mut buf = [0u8; MAX_NAME];
        buf[..3].copy_from_slice(b"abc");
        assert_eq!(name_str(&buf), "abc");
    }
}
