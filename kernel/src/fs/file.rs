//! System-wide open-file table (§4.9).
//!
//! Every file descriptor a process holds is an index into its own
//! fixed-size `ofile` array (see [`crate::process::pcb`]), each slot
//! owning one reference into this pool. A pool entry is either an open
//! inode or one of the three standard-stream stubs; `ref == 0` iff
//! `kind == FileKind::None`.

use crate::config::{open_flags, NFILE};
use crate::error::{KernelError, KernelResult};
use crate::mm::page_table::{self, PageTableRoot};
use crate::sync::GlobalState;
use spin::Mutex;

use super::dir;
use super::inode::{self, InodeHandle, InodeType};

/// What a file-table entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// An unused slot.
    None,
    /// An open on-disk inode.
    Inode,
    /// One of the three standard streams, backed by the SBI console.
    Stdio,
}

struct FileEntry {
    kind: FileKind,
    refcount: u32,
    readable: bool,
    writable: bool,
    offset: u32,
    inode: Option<InodeHandle>,
}

impl FileEntry {
    const fn empty() -> Self {
        Self {
            kind: FileKind::None,
            refcount: 0,
            readable: false,
            writable: false,
            offset: 0,
            inode: None,
        }
    }
}

/// Handle to a live entry in the system-wide file table: its slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(usize);

static FTABLE: GlobalState<Mutex<[FileEntry; NFILE]>> = GlobalState::new();

pub fn init() {
    if FTABLE
        .init(Mutex::new(core::array::from_fn(|_| FileEntry::empty())))
        .is_err()
    {
        crate::kpanic!("file table: init called twice");
    }
}

fn with_table<R>(f: impl FnOnce(&mut [FileEntry; NFILE]) -> R) -> R {
    FTABLE
        .with(|mtx| f(&mut mtx.lock()))
        .unwrap_or_else(|| crate::kpanic!("file table used before init"))
}

/// Claim a free pool slot. The system-wide table has no pinned entries,
/// so exhaustion is recoverable, not fatal: too many simultaneously open
/// files is a normal resource-exhaustion condition a caller can retry or
/// report.
pub fn filealloc() -> KernelResult<FileHandle> {
    with_table(|table| {
        for (i, slot) in table.iter().enumerate() {
            if slot.refcount == 0 {
                table[i].refcount = 1;
                return Ok(FileHandle(i));
            }
        }
        Err(KernelError::FileTableFull)
    })
}

/// Bump an existing entry's reference count (used when a descriptor is
/// duplicated, e.g. by `fork`).
pub fn filedup(handle: FileHandle) -> FileHandle {
    with_table(|table| table[handle.0].refcount += 1);
    handle
}

/// Drop a reference; at zero, release the backing inode (if any) and
/// return the slot to the pool.
pub fn fileclose(handle: FileHandle) {
    let (should_free, inode_handle) = with_table(|table| {
        let slot = &mut table[handle.0];
        slot.refcount -= 1;
        if slot.refcount == 0 {
            (true, slot.inode.take())
        } else {
            (false, None)
        }
    });
    if should_free {
        if let Some(ih) = inode_handle {
            inode::iput(ih);
        }
        with_table(|table| table[handle.0].kind = FileKind::None);
    }
}

fn stdio_readable_writable(mode: u32) -> (bool, bool) {
    match mode & 0x3 {
        open_flags::O_WRONLY => (false, true),
        open_flags::O_RDWR => (true, true),
        _ => (true, false),
    }
}

/// Open `path` under `mode`'s flags, per §4.9:
/// - with `O_CREATE`, create a fresh `File` inode if none exists, or
///   reuse an existing one of type `File` (any other existing type
///   fails);
/// - without it, resolve the path and fail if it does not exist;
/// - truncate the inode if `O_TRUNC` was requested.
pub fn fileopen(path: &str, mode: u32) -> KernelResult<FileHandle> {
    let ih = if mode & open_flags::O_CREATE != 0 {
        match dir::namei(path) {
            Ok(existing) => {
                if inode::itype(existing) != InodeType::File {
                    inode::iput(existing);
                    return Err(KernelError::NotAFile);
                }
                existing
            }
            Err(_) => {
                let name = path.rsplit('/').next().unwrap_or(path);
                let created = inode::ialloc(crate::config::ROOTDEV, InodeType::File);
                let root = dir::root_dir();
                let link_result = dir::dirlink(root, name, inode::inum(created));
                inode::iput(root);
                link_result?;
                created
            }
        }
    } else {
        dir::namei(path)?
    };

    if mode & open_flags::O_TRUNC != 0 {
        inode::itrunc(ih);
    }

    let (readable, writable) = stdio_readable_writable(mode);
    let handle = match filealloc() {
        Ok(h) => h,
        Err(e) => {
            inode::iput(ih);
            return Err(e);
        }
    };
    with_table(|table| {
        let slot = &mut table[handle.0];
        slot.kind = FileKind::Inode;
        slot.readable = readable;
        slot.writable = writable;
        slot.offset = 0;
        slot.inode = Some(ih);
    });
    Ok(handle)
}

/// Wire a pool slot directly to one of the three standard streams,
/// bypassing `fileopen`/`namei`. Called once per process at creation to
/// populate descriptors 0/1/2.
pub fn fileopen_stdio(readable: bool, writable: bool) -> KernelResult<FileHandle> {
    let handle = filealloc()?;
    with_table(|table| {
        let slot = &mut table[handle.0];
        slot.kind = FileKind::Stdio;
        slot.readable = readable;
        slot.writable = writable;
        slot.offset = 0;
        slot.inode = None;
    });
    Ok(handle)
}

const COPY_CHUNK: usize = 512;

/// Read up to `len` bytes from `handle` into the calling process's
/// virtual address `va`, advancing the file's offset by the amount
/// transferred. Staged through a small kernel buffer since `readi`/the
/// console only ever touch kernel memory directly.
pub fn inoderead(handle: FileHandle, root: PageTableRoot, va: usize, len: usize) -> KernelResult<u32> {
    let (kind, readable, inode_h, offset) = with_table(|table| {
        let slot = &table[handle.0];
        (slot.kind, slot.readable, slot.inode, slot.offset)
    });
    if !readable || kind == FileKind::None {
        return Err(KernelError::BadFileDescriptor);
    }

    match kind {
        FileKind::Inode => {
            let ih = inode_h.expect("Inode-kind file entry missing its inode handle");
            let mut done = 0usize;
            let mut buf = [0u8; COPY_CHUNK];
            while done < len {
                let chunk = (len - done).min(COPY_CHUNK);
                let n = inode::readi(ih, &mut buf[..chunk], offset + done as u32, chunk as u32)?;
                if n == 0 {
                    break;
                }
                page_table::copyout(root, va + done, &buf[..n as usize])?;
                done += n as usize;
                if (n as usize) < chunk {
                    break;
                }
            }
            with_table(|table| table[handle.0].offset += done as u32);
            Ok(done as u32)
        }
        FileKind::Stdio => {
            let mut done = 0usize;
            let mut buf = [0u8; COPY_CHUNK];
            while done < len {
                let chunk = (len - done).min(COPY_CHUNK);
                for b in buf[..chunk].iter_mut() {
                    *b = loop {
                        if let Some(ch) = crate::arch::riscv64::sbi::console_getchar() {
                            break ch;
                        }
                    };
                }
                page_table::copyout(root, va + done, &buf[..chunk])?;
                done += chunk;
            }
            Ok(done as u32)
        }
        FileKind::None => unreachable!(),
    }
}

/// Write up to `len` bytes from the calling process's virtual address
/// `va` into `handle`, advancing the file's offset by the amount
/// transferred.
pub fn inodewrite(handle: FileHandle, root: PageTableRoot, va: usize, len: usize) -> KernelResult<u32> {
    let (kind, writable, inode_h, offset) = with_table(|table| {
        let slot = &table[handle.0];
        (slot.kind, slot.writable, slot.inode, slot.offset)
    });
    if !writable || kind == FileKind::None {
        return Err(KernelError::BadFileDescriptor);
    }

    match kind {
        FileKind::Inode => {
            let ih = inode_h.expect("Inode-kind file entry missing its inode handle");
            let mut done = 0usize;
            let mut buf = [0u8; COPY_CHUNK];
            while done < len {
                let chunk = (len - done).min(COPY_CHUNK);
                page_table::copyin(root, va + done, &mut buf[..chunk])?;
                let n = inode::writei(ih, &buf[..chunk], offset + done as u32, chunk as u32)?;
                done += n as usize;
                if (n as usize) < chunk {
                    break;
                }
            }
            with_table(|table| table[handle.0].offset += done as u32);
            Ok(done as u32)
        }
        FileKind::Stdio => {
            let mut done = 0usize;
            let mut buf = [0u8; COPY_CHUNK];
            while done < len {
                let chunk = (len - done).min(COPY_CHUNK);
                page_table::copyin(root, va + done, &mut buf[..chunk])?;
                for &b in &buf[..chunk] {
                    crate::arch::riscv64::sbi::console_putchar(b);
                }
                done += chunk;
            }
            Ok(done as u32)
        }
        FileKind::None => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn setup(dev: u32) {
        crate::mm::heap::init_for_test();
        crate::fs::blockdev::mock::reset();
        super::super::blockcache::init();
        super::super::superblock::format_mock_disk(dev);
        super::super::superblock::init(dev);
        inode::init();
        init();
    }

    #[test]
    fn create_then_reopen_finds_same_inode() {
        let dev = crate::config::ROOTDEV;
        setup(dev);
        let a = fileopen("greeting.txt", open_flags::O_CREATE | open_flags::O_RDWR).unwrap();
        let ino_a = with_table(|t| t[a.0].inode.unwrap());
        fileclose(a);
        let b = fileopen("greeting.txt", open_flags::O_RDONLY).unwrap();
        let ino_b = with_table(|t| t[b.0].inode.unwrap());
        assert_eq!(inode::inum(ino_a), inode::inum(ino_b));
    }

    #[test]
    fn open_missing_without_create_fails() {
        let dev = crate::config::ROOTDEV;
        setup(dev);
        assert!(matches!(
            fileopen("nope.txt", open_flags::O_RDONLY),
            Err(KernelError::FileNotFound)
        ));
    }

    #[test]
    fn pool_exhaustion_is_recoverable() {
        let dev = crate::config::ROOTDEV;
        setup(dev);
        let mut handles = Vec::new();
        for _ in 0..NFILE {
            handles.push(filealloc().unwrap());
        }
        assert!(matches!(filealloc(), Err(KernelError::FileTableFull)));
        for h in handles {
            fileclose(h);
        }
    }
}
