//! Architecture support.
//!
//! This kernel targets a single architecture (`riscv64gc-unknown-none-elf`
//! on QEMU's `virt` machine); the module tree still separates
//! architecture-specific code behind this boundary so the split between
//! portable kernel logic and RISC-V particulars stays visible.

pub mod riscv64;

pub use riscv64::*;
