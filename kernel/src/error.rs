//! Kernel error type and the fatal-panic macro.
//!
//! Recoverable conditions (§7) are represented as `KernelError` and
//! propagated with `?` up to the syscall-dispatch boundary, which collapses
//! them to the negative `isize` the ABI returns to user space. Fatal
//! conditions call [`kpanic!`], which logs a location-tagged message at
//! `error` level and then diverges.

use core::fmt;

/// Recoverable kernel error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// The frame allocator's free list was empty.
    OutOfMemory,
    /// A user-supplied virtual address had no valid mapping.
    UnmappedAddress { addr: usize },
    /// A page-table operation needed a fresh table frame and allocation
    /// failed.
    PageTableAlloc,
    /// A virtual address passed to an operation requiring page alignment
    /// was not aligned.
    Unaligned { addr: usize },

    /// No matching child process exists for a `wait` call.
    NoSuchChild,
    /// The fixed process pool had no `Unused` slot to allocate.
    ProcessTableFull,
    /// `exec` named an image absent from the loader's embedded table.
    NoSuchProgram,

    /// A path did not resolve to an existing directory entry.
    FileNotFound,
    /// `open` without `O_CREATE` named a path with no existing inode, or
    /// `O_CREATE` raced an existing name of the wrong type.
    NotAFile,
    /// `dirlink` was asked to insert a name that already exists.
    NameExists,
    /// A read/write offset plus length overflowed `MAXFILE * BSIZE`.
    FileTooLarge,
    /// The per-process descriptor table had no free slot, or a supplied fd
    /// was out of range / unused.
    BadFileDescriptor,
    /// The system-wide open-file table had no free slot.
    FileTableFull,

    /// `sbrk` would move the break below the process's heap bottom.
    InvalidBreak,

    /// A value fell outside its accepted domain; named for diagnostics.
    InvalidArgument { what: &'static str },
}

/// Result type alias used throughout the kernel's recoverable paths.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::UnmappedAddress { addr } => write!(f, "unmapped user address 0x{addr:x}"),
            Self::PageTableAlloc => write!(f, "failed to allocate a page-table frame"),
            Self::Unaligned { addr } => write!(f, "address 0x{addr:x} is not page-aligned"),
            Self::NoSuchChild => write!(f, "no matching child process"),
            Self::ProcessTableFull => write!(f, "process table full"),
            Self::NoSuchProgram => write!(f, "no such embedded program"),
            Self::FileNotFound => write!(f, "no such file or directory"),
            Self::NotAFile => write!(f, "path does not name a regular file"),
            Self::NameExists => write!(f, "name already exists in directory"),
            Self::FileTooLarge => write!(f, "file offset/length exceeds MAXFILE"),
            Self::BadFileDescriptor => write!(f, "bad file descriptor"),
            Self::FileTableFull => write!(f, "system file table full"),
            Self::InvalidBreak => write!(f, "sbrk delta would underflow heap bottom"),
            Self::InvalidArgument { what } => write!(f, "invalid argument: {what}"),
        }
    }
}

/// Log a location-tagged fatal message and diverge.
///
/// This is the kernel's one and only divergence point for the fatal
/// conditions of §7 (block-cache exhaustion, inode-table exhaustion, bitmap
/// exhaustion, double free, page-table remap collision, unaligned unmap,
/// unknown trap from kernel mode, non-zero device status).
#[macro_export]
macro_rules! kpanic {
    ($($arg:tt)*) => {{
        log::error!("[{}:{}] {}", file!(), line!(), format_args!($($arg)*));
        panic!($($arg)*)
    }};
}
