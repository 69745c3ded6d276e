//! Bare-metal file-system scenarios (§8): exercises the bitmap allocator,
//! inode layer, and directory layer directly against the real virtio-mmio
//! disk, bypassing the process/syscall layer (there is no running process
//! to own a page table yet). Each scenario logs its own outcome and the
//! whole test ends with one pass/fail marker line.
//!
//! Not run on the host, for the same reasons as `boot.rs`.

#![no_std]
#![no_main]

#[path = "../src/arch/riscv64/boot.rs"]
mod boot;

use sv39_kernel::fs::inode::InodeType;
use sv39_kernel::fs::{dir, inode};
use sv39_kernel::{arch, config, drivers, fs, logger, mm};

#[no_mangle]
pub extern "C" fn rust_main() -> ! {
    logger::init();

    // SAFETY: see `boot.rs`.
    unsafe {
        mm::init();
    }
    arch::init();
    drivers::virtio_blk::init();
    fs::init(config::ROOTDEV);

    let mut failures = 0u32;
    check("small file round-trips through read/write", scenario_small_file, &mut failures);
    check("large file crosses into the indirect block", scenario_indirect_block, &mut failures);
    check("truncate shrinks a file back to zero", scenario_truncate, &mut failures);
    check("directory lookup of a missing name fails", scenario_missing_lookup, &mut failures);

    if failures == 0 {
        logger::console_putstr("BOOTOK\n");
    } else {
        logger::console_putstr("BOOTFAIL\n");
    }
    arch::halt();
}

fn check(name: &str, f: fn() -> bool, failures: &mut u32) {
    if f() {
        log::info!("[ok] {name}");
    } else {
        log::error!("[failed] {name}");
        *failures += 1;
    }
}

fn scenario_small_file() -> bool {
    let dev = config::ROOTDEV;
    let ino = inode::ialloc(dev, InodeType::File);
    let parent = dir::root_dir();
    if dir::dirlink(parent, "smallfile", inode::inum(ino)).is_err() {
        return false;
    }

    let payload = b"hello from a teaching kernel";
    if inode::writei(ino, payload, 0, payload.len() as u32).unwrap_or(0) as usize != payload.len() {
        return false;
    }

    let mut buf = [0u8; 64];
    let n = match inode::readi(ino, &mut buf, 0, payload.len() as u32) {
        Ok(n) => n as usize,
        Err(_) => return false,
    };
    &buf[..n] == &payload[..]
}

fn scenario_indirect_block() -> bool {
    let dev = config::ROOTDEV;
    let ino = inode::ialloc(dev, InodeType::File);
    let parent = dir::root_dir();
    if dir::dirlink(parent, "bigfile", inode::inum(ino)).is_err() {
        return false;
    }

    // One byte per block past the direct addressing limit, forcing the
    // write through the single indirect block.
    let past_direct = (config::NDIRECT as u32 + 2) * config::BSIZE as u32;
    let marker = [0xabu8];
    if inode::writei(ino, &marker, past_direct, 1).unwrap_or(0) != 1 {
        return false;
    }

    let mut buf = [0u8; 1];
    match inode::readi(ino, &mut buf, past_direct, 1) {
        Ok(1) => buf[0] == 0xab,
        _ => false,
    }
}

fn scenario_truncate() -> bool {
    let dev = config::ROOTDEV;
    let ino = inode::ialloc(dev, InodeType::File);
    let parent = dir::root_dir();
    if dir::dirlink(parent, "trunc", inode::inum(ino)).is_err() {
        return false;
    }
    let payload = [0x42u8; 128];
    if inode::writei(ino, &payload, 0, payload.len() as u32).is_err() {
        return false;
    }
    inode::itrunc(ino);
    inode::isize(ino) == 0
}

fn scenario_missing_lookup() -> bool {
    dir::namei("/does-not-exist").is_err()
}
