//! Device drivers.
//!
//! This kernel talks to exactly one device beyond the core platform (SBI
//! console, PLIC, timer, all under [`crate::arch`]): the virtio-mmio block
//! device backing the file system (§4.6, §4.7).

pub mod virtio_blk;
