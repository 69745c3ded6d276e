//! Platform-Level Interrupt Controller driver (SiFive PLIC, QEMU `virt`).
//!
//! | Region             | Offset    | Size per entry  |
//! |--------------------|-----------|-----------------|
//! | Priority           | 0x00_0000 | 4 bytes/source  |
//! | Pending            | 0x00_1000 | 1 bit/source    |
//! | Enable             | 0x00_2000 | 0x80/context    |
//! | Priority threshold | 0x20_0000 | 0x1000/context  |
//! | Claim/complete     | 0x20_0004 | 0x1000/context  |
//!
//! The boot hart has two contexts: M-mode (even) and S-mode (odd). This
//! kernel runs entirely in S-mode on hart 0, so it only ever programs
//! context 1.

use core::sync::atomic::{fence, Ordering};

use spin::Mutex;

use crate::config;
use crate::error::{KernelError, KernelResult};
use crate::sync::GlobalState;

const PLIC_PRIORITY_OFFSET: usize = 0x00_0000;
const PLIC_PENDING_OFFSET: usize = 0x00_1000;
const PLIC_ENABLE_OFFSET: usize = 0x00_2000;
const PLIC_ENABLE_STRIDE: usize = 0x80;
const PLIC_THRESHOLD_OFFSET: usize = 0x20_0000;
const PLIC_CLAIM_OFFSET: usize = 0x20_0004;
const PLIC_CONTEXT_STRIDE: usize = 0x1000;

/// S-mode context for hart 0.
const S_CONTEXT: u32 = 1;
/// Highest valid interrupt source (QEMU `virt` provisions 128 sources;
/// source 0 is reserved).
const MAX_IRQ: u32 = 127;
/// Highest valid priority; 0 means "never interrupt".
const MAX_PRIORITY: u32 = 7;

static PLIC: GlobalState<Mutex<Plic>> = GlobalState::new();

struct Plic {
    base: usize,
}

impl Plic {
    fn priority_addr(&self, irq: u32) -> *mut u32 {
        (self.base + PLIC_PRIORITY_OFFSET + (irq as usize) * 4) as *mut u32
    }

    fn pending_addr(&self, irq: u32) -> *const u32 {
        (self.base + PLIC_PENDING_OFFSET + ((irq as usize) / 32) * 4) as *const u32
    }

    fn enable_addr(&self, irq: u32) -> *mut u32 {
        (self.base
            + PLIC_ENABLE_OFFSET
            + (S_CONTEXT as usize) * PLIC_ENABLE_STRIDE
            + ((irq as usize) / 32) * 4) as *mut u32
    }

    fn threshold_addr(&self) -> *mut u32 {
        (self.base + PLIC_THRESHOLD_OFFSET + (S_CONTEXT as usize) * PLIC_CONTEXT_STRIDE) as *mut u32
    }

    fn claim_complete_addr(&self) -> *mut u32 {
        (self.base + PLIC_CLAIM_OFFSET + (S_CONTEXT as usize) * PLIC_CONTEXT_STRIDE) as *mut u32
    }

    fn validate_irq(&self, irq: u32) -> KernelResult<()> {
        if irq == 0 || irq > MAX_IRQ {
            return Err(KernelError::InvalidArgument { what: "irq out of range" });
        }
        Ok(())
    }

    fn set_priority(&self, irq: u32, priority: u32) -> KernelResult<()> {
        self.validate_irq(irq)?;
        if priority > MAX_PRIORITY {
            return Err(KernelError::InvalidArgument { what: "priority exceeds 7" });
        }
        // SAFETY: `priority_addr` points into the PLIC MMIO region at an
        // offset validated to be within [1, MAX_IRQ].
        unsafe { core::ptr::write_volatile(self.priority_addr(irq), priority) };
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn enable_irq(&self, irq: u32) -> KernelResult<()> {
        self.validate_irq(irq)?;
        let addr = self.enable_addr(irq);
        let bit = 1u32 << (irq % 32);
        // SAFETY: `enable_addr` points into the S-mode context's enable
        // word array; read-modify-write preserves the other sources' bits.
        unsafe {
            let current = core::ptr::read_volatile(addr);
            core::ptr::write_volatile(addr, current | bit);
        }
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn set_threshold(&self, threshold: u32) -> KernelResult<()> {
        if threshold > MAX_PRIORITY {
            return Err(KernelError::InvalidArgument { what: "threshold exceeds 7" });
        }
        // SAFETY: `threshold_addr` points at the S-mode context's threshold
        // register, a fixed offset within the PLIC MMIO region.
        unsafe { core::ptr::write_volatile(self.threshold_addr(), threshold) };
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Claim the highest-priority pending interrupt, or `None` if nothing
    /// is pending.
    fn claim(&self) -> Option<u32> {
        // SAFETY: reading the claim/complete register atomically claims the
        // highest-priority pending source and clears its pending bit.
        let irq = unsafe { core::ptr::read_volatile(self.claim_complete_addr()) };
        (irq != 0).then_some(irq)
    }

    /// Signal end-of-interrupt for a source obtained from `claim`.
    fn complete(&self, irq: u32) -> KernelResult<()> {
        self.validate_irq(irq)?;
        // SAFETY: writing the claimed source ID back to the claim/complete
        // register is the PLIC's documented EOI handshake.
        unsafe { core::ptr::write_volatile(self.claim_complete_addr(), irq) };
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self) {
        for irq in 1..=MAX_IRQ {
            // SAFETY: each source's priority register lies within the PLIC
            // MMIO region; writing 0 disables it.
            unsafe { core::ptr::write_volatile(self.priority_addr(irq), 0) };
        }
        let enable_words = (MAX_IRQ as usize + 32) / 32;
        for word in 0..enable_words {
            let addr = (self.base
                + PLIC_ENABLE_OFFSET
                + (S_CONTEXT as usize) * PLIC_ENABLE_STRIDE
                + word * 4) as *mut u32;
            // SAFETY: within the S-mode context's enable word array.
            unsafe { core::ptr::write_volatile(addr, 0) };
        }
        // SAFETY: the S-mode context's threshold register.
        unsafe { core::ptr::write_volatile(self.threshold_addr(), 0) };
        fence(Ordering::SeqCst);
    }
}

/// Reset the PLIC (all sources disabled, threshold 0) and record the
/// global instance. Calling this twice is a boot-sequencing bug.
pub fn init() {
    let plic = Plic { base: config::plic::BASE };
    plic.reset();
    log::info!("plic: reset, base=0x{:x}, s-mode context={S_CONTEXT}", config::plic::BASE);
    if PLIC.init(Mutex::new(plic)).is_err() {
        crate::kpanic!("plic::init called twice");
    }
}

fn with_plic<R>(f: impl FnOnce(&Plic) -> R) -> R {
    PLIC.with(|mtx| f(&mtx.lock()))
        .unwrap_or_else(|| crate::kpanic!("plic used before init"))
}

/// Set the priority of an interrupt source (0 disables it, 1..=7 enables
/// delivery when the threshold is lower).
pub fn set_priority(irq: u32, priority: u32) -> KernelResult<()> {
    with_plic(|plic| plic.set_priority(irq, priority))
}

/// Enable an interrupt source for the boot hart's S-mode context.
pub fn enable(irq: u32) -> KernelResult<()> {
    with_plic(|plic| plic.enable_irq(irq))
}

/// Set the S-mode priority threshold; only sources with priority strictly
/// greater than this value are delivered.
pub fn set_threshold(threshold: u32) -> KernelResult<()> {
    with_plic(|plic| plic.set_threshold(threshold))
}

/// Claim the highest-priority pending interrupt.
pub fn claim() -> Option<u32> {
    with_plic(|plic| plic.claim())
}

/// Signal end-of-interrupt for a source obtained from `claim`.
pub fn complete(irq: u32) -> KernelResult<()> {
    with_plic(|plic| plic.complete(irq))
}
