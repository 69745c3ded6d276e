//! The one block device this kernel talks to (§4.6, §4.7).
//!
//! Everything above this module addresses blocks by `(dev, blockno)`, but
//! `dev` is vestigial: [`crate::config::ROOTDEV`] is the only device that
//! exists. `read_block`/`write_block` forward to the virtio-mmio driver on
//! the target platform; host-side tests substitute an in-memory disk image
//! so the bitmap/inode/directory logic can be exercised without real
//! hardware.

use crate::config::BSIZE;

#[cfg(target_arch = "riscv64")]
pub fn read_block(blockno: u32, data: &mut [u8; BSIZE]) {
    crate::drivers::virtio_blk::read_block(blockno, data);
}

#[cfg(target_arch = "riscv64")]
pub fn write_block(blockno: u32, data: &[u8; BSIZE]) {
    crate::drivers::virtio_blk::write_block(blockno, data);
}

#[cfg(not(target_arch = "riscv64"))]
pub use mock::{read_block, write_block};

#[cfg(not(target_arch = "riscv64"))]
pub mod mock {
    //! A RAM-backed stand-in for the disk image, used by host-side tests
    //! (and any non-riscv64 build) in place of real virtio-mmio hardware.

    use spin::Mutex;

    use crate::config::{BSIZE, FS_SIZE};

    static DISK: Mutex<[[u8; BSIZE]; FS_SIZE as usize]> = Mutex::new([[0u8; BSIZE]; FS_SIZE as usize]);

    pub fn read_block(blockno: u32, data: &mut [u8; BSIZE]) {
        data.copy_from_slice(&DISK.lock()[blockno as usize]);
    }

    pub fn write_block(blockno: u32, data: &[u8; BSIZE]) {
        DISK.lock()[blockno as usize].copy_from_slice(data);
    }

    /// Reset the mock disk to all zeroes, for test isolation.
    pub fn reset() {
        *DISK.lock() = [[0u8; BSIZE]; FS_SIZE as usize];
    }
}
