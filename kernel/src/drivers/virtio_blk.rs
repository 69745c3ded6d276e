//! Virtio-mmio block driver (§4.7).
//!
//! A single legacy (version 1) split virtqueue of size
//! [`virtio::QUEUE_SIZE`], probed at the fixed QEMU `virt` MMIO window.
//! Every disk operation is a three-descriptor chain (request header / data
//! / status byte) and a busy-wait interlock: interrupts are enabled only
//! for the duration of `submit`'s wait, and the only way the wait ends is
//! the external-interrupt dispatcher calling [`handle_interrupt`].

use core::mem::size_of;
use core::sync::atomic::{fence, AtomicBool, Ordering};

use spin::Mutex;

use crate::config::{virtio, BSIZE, PAGE_SIZE, SECTORS_PER_BLOCK};
use crate::sync::GlobalState;

mod reg {
    pub const MAGIC_VALUE: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const VENDOR_ID: usize = 0x00c;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const GUEST_PAGE_SIZE: usize = 0x028;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_ALIGN: usize = 0x03c;
    pub const QUEUE_PFN: usize = 0x040;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
}

mod status_bit {
    pub const ACKNOWLEDGE: u32 = 1;
    pub const DRIVER: u32 = 2;
    pub const DRIVER_OK: u32 = 4;
    pub const FEATURES_OK: u32 = 8;
}

/// Feature bits this driver declines, matching the "clearing feature bits
/// not supported" step of bring-up (§4.7): read-only, SCSI passthrough,
/// config-generation write-enable, multiqueue, any-layout, the used-ring
/// event index, and indirect descriptors. None of them are needed by a
/// driver that always issues plain three-descriptor chains.
mod feature_bit {
    pub const BLK_RO: u32 = 1 << 5;
    pub const BLK_SCSI: u32 = 1 << 7;
    pub const BLK_CONFIG_WCE: u32 = 1 << 11;
    pub const BLK_MQ: u32 = 1 << 12;
    pub const RING_EVENT_IDX: u32 = 1 << 29;
    pub const RING_INDIRECT_DESC: u32 = 1 << 28;
    pub const ANY_LAYOUT: u32 = 1 << 27;
}

const DESC_F_NEXT: u16 = 1;
const DESC_F_WRITE: u16 = 2;

const BLK_T_IN: u32 = 0;
const BLK_T_OUT: u32 = 1;

const QUEUE_SIZE: usize = virtio::QUEUE_SIZE;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Desc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
struct Avail {
    flags: u16,
    idx: u16,
    ring: [u16; QUEUE_SIZE],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct UsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct UsedRing {
    flags: u16,
    idx: u16,
    ring: [UsedElem; QUEUE_SIZE],
}

/// Descriptor table and available ring share page 0; the used ring is
/// page-aligned into page 1. The legacy MMIO transport publishes a single
/// `QueuePFN` for the whole queue, so these two pages must be adjacent,
/// physically contiguous frames.
#[repr(C, align(4096))]
struct QueuePage0 {
    desc: [Desc; QUEUE_SIZE],
    avail: Avail,
}

#[repr(C, align(4096))]
struct QueuePage1 {
    used: UsedRing,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RequestHeader {
    typ: u32,
    reserved: u32,
    sector: u64,
}

/// One request header and one status byte per descriptor slot, indexed by
/// the chain's head descriptor -- stable memory the device's DMA can
/// target for the lifetime of a request.
static mut HEADERS: [RequestHeader; QUEUE_SIZE] = [RequestHeader { typ: 0, reserved: 0, sector: 0 }; QUEUE_SIZE];
static mut STATUSES: [u8; QUEUE_SIZE] = [0xff; QUEUE_SIZE];

/// "Device owns this buffer" flags, one per possible chain-head index.
/// Plain atomics rather than state behind the queue's `Mutex`: the
/// completion handler runs nested inside `submit`'s busy-wait (on the same
/// hart, via the external-interrupt trap), and must never need a lock
/// `submit` might be holding.
static PENDING: [AtomicBool; QUEUE_SIZE] = [const { AtomicBool::new(false) }; QUEUE_SIZE];

struct Queue {
    base: usize,
    page0: &'static mut QueuePage0,
    page1: &'static mut QueuePage1,
    free: [bool; QUEUE_SIZE],
    num_free: usize,
    next_avail: u16,
    last_used: u16,
}

impl Queue {
    fn alloc_desc(&mut self) -> Option<usize> {
        let idx = self.free.iter().position(|&f| f)?;
        self.free[idx] = false;
        self.num_free -= 1;
        Some(idx)
    }

    fn free_chain(&mut self, head: usize) {
        let mut idx = head;
        loop {
            let desc = self.page0.desc[idx];
            self.free[idx] = true;
            self.num_free += 1;
            self.page0.desc[idx] = Desc::default();
            if desc.flags & DESC_F_NEXT == 0 {
                break;
            }
            idx = desc.next as usize;
        }
    }
}

static QUEUE: GlobalState<Mutex<Queue>> = GlobalState::new();

fn with_queue<R>(f: impl FnOnce(&mut Queue) -> R) -> R {
    QUEUE
        .with(|mtx| f(&mut mtx.lock()))
        .unwrap_or_else(|| crate::kpanic!("virtio-blk used before init"))
}

fn reg_read(base: usize, offset: usize) -> u32 {
    // SAFETY: `offset` is one of the fixed virtio-mmio register offsets,
    // always within the device's MMIO window.
    unsafe { core::ptr::read_volatile((base + offset) as *const u32) }
}

fn reg_write(base: usize, offset: usize, value: u32) {
    // SAFETY: same as `reg_read`.
    unsafe { core::ptr::write_volatile((base + offset) as *mut u32, value) }
}

/// Probe the device, negotiate features, publish the queue, and advance
/// the status register through `Acknowledge -> Driver -> Features-OK ->
/// Driver-OK` (§4.7). Fatal on any mismatch or resource exhaustion --
/// there is no recovering from a missing or malformed boot-time device.
pub fn init() {
    let base = virtio::MMIO_BASE;

    if reg_read(base, reg::MAGIC_VALUE) != virtio::MAGIC {
        crate::kpanic!("virtio-blk: bad magic value at 0x{base:x}");
    }
    if reg_read(base, reg::VERSION) != virtio::VERSION {
        crate::kpanic!("virtio-blk: unsupported transport version at 0x{base:x}");
    }
    if reg_read(base, reg::DEVICE_ID) != virtio::DEVICE_ID {
        crate::kpanic!("virtio-blk: device id mismatch at 0x{base:x}");
    }
    if reg_read(base, reg::VENDOR_ID) != virtio::VENDOR_ID {
        crate::kpanic!("virtio-blk: vendor id mismatch at 0x{base:x}");
    }

    reg_write(base, reg::STATUS, 0);
    reg_write(base, reg::STATUS, status_bit::ACKNOWLEDGE);
    reg_write(base, reg::STATUS, status_bit::ACKNOWLEDGE | status_bit::DRIVER);

    let offered = reg_read(base, reg::DEVICE_FEATURES);
    let accepted = offered
        & !(feature_bit::BLK_RO
            | feature_bit::BLK_SCSI
            | feature_bit::BLK_CONFIG_WCE
            | feature_bit::BLK_MQ
            | feature_bit::RING_EVENT_IDX
            | feature_bit::RING_INDIRECT_DESC
            | feature_bit::ANY_LAYOUT);
    reg_write(base, reg::DRIVER_FEATURES, accepted);
    reg_write(
        base,
        reg::STATUS,
        status_bit::ACKNOWLEDGE | status_bit::DRIVER | status_bit::FEATURES_OK,
    );
    if reg_read(base, reg::STATUS) & status_bit::FEATURES_OK == 0 {
        crate::kpanic!("virtio-blk: device rejected our feature subset");
    }

    reg_write(base, reg::QUEUE_SEL, 0);
    let max = reg_read(base, reg::QUEUE_NUM_MAX);
    if max == 0 {
        crate::kpanic!("virtio-blk: queue 0 unavailable");
    }
    if (max as usize) < QUEUE_SIZE {
        crate::kpanic!("virtio-blk: queue 0 too small ({max} < {QUEUE_SIZE})");
    }
    reg_write(base, reg::QUEUE_NUM, QUEUE_SIZE as u32);
    reg_write(base, reg::GUEST_PAGE_SIZE, PAGE_SIZE as u32);
    reg_write(base, reg::QUEUE_ALIGN, PAGE_SIZE as u32);

    let page0_frame = crate::mm::frame_allocator::alloc()
        .unwrap_or_else(|e| crate::kpanic!("virtio-blk: allocating queue page 0: {e}"));
    let page1_frame = crate::mm::frame_allocator::alloc()
        .unwrap_or_else(|e| crate::kpanic!("virtio-blk: allocating queue page 1: {e}"));
    if page1_frame.addr() != page0_frame.addr() + PAGE_SIZE {
        crate::kpanic!("virtio-blk: queue frames are not contiguous");
    }
    // SAFETY: both frames were just allocated and are exclusively owned by
    // this queue for the life of the kernel.
    unsafe {
        core::ptr::write_bytes(page0_frame.addr() as *mut u8, 0, PAGE_SIZE);
        core::ptr::write_bytes(page1_frame.addr() as *mut u8, 0, PAGE_SIZE);
    }
    reg_write(base, reg::QUEUE_PFN, (page0_frame.addr() / PAGE_SIZE) as u32);

    // SAFETY: `page0_frame`/`page1_frame` are zeroed, page-aligned, and
    // sized to hold `QueuePage0`/`QueuePage1` exactly; nothing else
    // references this memory.
    let page0: &'static mut QueuePage0 = unsafe { &mut *(page0_frame.addr() as *mut QueuePage0) };
    let page1: &'static mut QueuePage1 = unsafe { &mut *(page1_frame.addr() as *mut QueuePage1) };

    let queue = Queue {
        base,
        page0,
        page1,
        free: [true; QUEUE_SIZE],
        num_free: QUEUE_SIZE,
        next_avail: 0,
        last_used: 0,
    };
    if QUEUE.init(Mutex::new(queue)).is_err() {
        crate::kpanic!("virtio-blk::init called twice");
    }

    reg_write(
        base,
        reg::STATUS,
        status_bit::ACKNOWLEDGE | status_bit::DRIVER | status_bit::FEATURES_OK | status_bit::DRIVER_OK,
    );

    crate::arch::plic::set_priority(virtio::IRQ, 1).unwrap_or_else(|e| crate::kpanic!("virtio-blk: {e}"));
    crate::arch::plic::enable(virtio::IRQ).unwrap_or_else(|e| crate::kpanic!("virtio-blk: {e}"));

    log::info!("virtio-blk: initialised at 0x{base:x}, queue size {QUEUE_SIZE}");
}

/// Run one request to completion (§4.7's `submit`). `write` selects
/// `BLK_T_OUT` (device reads `data`) vs. `BLK_T_IN` (device writes `data`).
fn submit(blockno: u32, data: &mut [u8; BSIZE], write: bool) {
    loop {
        let heads = with_queue(|q| {
            if q.num_free < 3 {
                return None;
            }
            let hdr = q.alloc_desc().expect("num_free >= 3 implies a free descriptor");
            let dat = q.alloc_desc().expect("num_free >= 3 implies a free descriptor");
            let st = q.alloc_desc().expect("num_free >= 3 implies a free descriptor");
            Some((hdr, dat, st))
        });
        let (hdr_i, dat_i, st_i) = match heads {
            Some(t) => t,
            None => {
                crate::process::yield_cpu();
                continue;
            }
        };

        // SAFETY: slot `hdr_i` was just allocated from the free list and is
        // exclusively owned by this request until `free_chain` below
        // returns it.
        unsafe {
            HEADERS[hdr_i] = RequestHeader {
                typ: if write { BLK_T_OUT } else { BLK_T_IN },
                reserved: 0,
                sector: blockno as u64 * SECTORS_PER_BLOCK as u64,
            };
            STATUSES[hdr_i] = 0xff;
        }
        PENDING[hdr_i].store(true, Ordering::SeqCst);

        with_queue(|q| {
            // SAFETY: `HEADERS`/`STATUSES` entries for `hdr_i` are owned by
            // this request and outlive it; the kernel's identity map means
            // their virtual addresses are their physical ones.
            let hdr_pa = unsafe { &HEADERS[hdr_i] as *const RequestHeader as u64 };
            let status_pa = unsafe { &STATUSES[hdr_i] as *const u8 as u64 };
            let data_pa = data.as_mut_ptr() as u64;

            q.page0.desc[hdr_i] = Desc {
                addr: hdr_pa,
                len: size_of::<RequestHeader>() as u32,
                flags: DESC_F_NEXT,
                next: dat_i as u16,
            };
            q.page0.desc[dat_i] = Desc {
                addr: data_pa,
                len: BSIZE as u32,
                flags: DESC_F_NEXT | if write { 0 } else { DESC_F_WRITE },
                next: st_i as u16,
            };
            q.page0.desc[st_i] = Desc {
                addr: status_pa,
                len: 1,
                flags: DESC_F_WRITE,
                next: 0,
            };

            let slot = (q.next_avail as usize) % QUEUE_SIZE;
            q.page0.avail.ring[slot] = hdr_i as u16;
            fence(Ordering::SeqCst);
            q.next_avail = q.next_avail.wrapping_add(1);
            q.page0.avail.idx = q.next_avail;
            fence(Ordering::SeqCst);
            reg_write(q.base, reg::QUEUE_NOTIFY, 0);
        });

        crate::arch::intr_on();
        while PENDING[hdr_i].load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
        crate::arch::intr_off();

        with_queue(|q| q.free_chain(hdr_i));
        return;
    }
}

/// External-interrupt handler for the virtio-blk IRQ (§4.7's `complete`):
/// acknowledge the device, then drain every newly completed request from
/// the used ring.
pub fn handle_interrupt() {
    with_queue(|q| {
        let status = reg_read(q.base, reg::INTERRUPT_STATUS);
        reg_write(q.base, reg::INTERRUPT_ACK, status);

        // SAFETY: `used.idx` is written by the device; a volatile read
        // keeps the compiler from caching a stale value across calls.
        let tail = unsafe { core::ptr::read_volatile(&q.page1.used.idx) };
        while q.last_used != tail {
            let slot = (q.last_used as usize) % QUEUE_SIZE;
            let id = q.page1.used.ring[slot].id as usize;
            // SAFETY: `id` is the chain-head index this completion names;
            // `submit` wrote a sentinel there before handing the chain to
            // the device.
            let status_byte = unsafe { STATUSES[id] };
            if status_byte != 0 {
                crate::kpanic!("virtio-blk: request {id} completed with non-zero status 0x{status_byte:x}");
            }
            PENDING[id].store(false, Ordering::SeqCst);
            q.last_used = q.last_used.wrapping_add(1);
        }
    });
}

/// Read disk block `blockno` into `data` (§4.6, §4.7).
pub fn read_block(blockno: u32, data: &mut [u8; BSIZE]) {
    submit(blockno, data, false);
}

/// Write `data` to disk block `blockno` (§4.6, §4.7).
pub fn write_block(blockno: u32, data: &[u8; BSIZE]) {
    // `submit` takes `&mut` because the same pointer also serves as the
    // device's read target on a block read; a write only ever reads it.
    let mut scratch = *data;
    submit(blockno, &mut scratch, true);
}
