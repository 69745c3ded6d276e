//! Fixed-size LRU block cache (§4.6).
//!
//! `NBUF` buffers are threaded into a doubly-linked ring headed by a
//! sentinel, ordered most-recently-used first. `get` is the only place the
//! ring is reordered; `release` splices a buffer whose reference count
//! dropped to zero back to the front.

use spin::Mutex;

use crate::config::{BSIZE, NBUF};
use crate::sync::GlobalState;

/// One cached disk block. The "device owns this buffer" flag named in
/// §3 is tracked by the virtio driver itself (keyed by descriptor-chain
/// head index, not by buffer slot), since a buffer can be recycled by
/// `get`'s LRU victim search the instant its refcount drops to zero,
/// while an in-flight request's completion still needs somewhere stable
/// to land regardless of what the cache has done with the buffer since.
pub struct Buf {
    pub valid: bool,
    pub dev: u32,
    pub blockno: u32,
    refcount: u32,
    pub data: [u8; BSIZE],
}

impl Buf {
    const fn empty() -> Self {
        Self {
            valid: false,
            dev: 0,
            blockno: 0,
            refcount: 0,
            data: [0u8; BSIZE],
        }
    }
}

/// Handle to a cached buffer: the slot index in the fixed pool. Copy and
/// cheap, unlike a reference, so callers can hold it across a `release`
/// that reorders the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufHandle(usize);

struct Cache {
    bufs: [Buf; NBUF],
    /// LRU ring of slot indices, front = most recently used.
    ring: [usize; NBUF],
    ring_len: usize,
}

impl Cache {
    fn new() -> Self {
        let mut ring = [0usize; NBUF];
        for (i, slot) in ring.iter_mut().enumerate() {
            *slot = i;
        }
        Self {
            bufs: core::array::from_fn(|_| Buf::empty()),
            ring,
            ring_len: NBUF,
        }
    }

    fn move_to_front(&mut self, slot: usize) {
        let pos = self.ring[..self.ring_len].iter().position(|&s| s == slot);
        if let Some(pos) = pos {
            self.ring[..=pos].rotate_right(1);
        }
    }

    /// Scan newest to oldest for `(dev, blockno)`; if absent, scan oldest
    /// to newest for a zero-refcount victim.
    fn get(&mut self, dev: u32, blockno: u32) -> BufHandle {
        for i in 0..self.ring_len {
            let slot = self.ring[i];
            if self.bufs[slot].valid && self.bufs[slot].dev == dev && self.bufs[slot].blockno == blockno {
                self.bufs[slot].refcount += 1;
                return BufHandle(slot);
            }
        }
        for i in (0..self.ring_len).rev() {
            let slot = self.ring[i];
            if self.bufs[slot].refcount == 0 {
                let buf = &mut self.bufs[slot];
                buf.dev = dev;
                buf.blockno = blockno;
                buf.valid = false;
                buf.refcount = 1;
                return BufHandle(slot);
            }
        }
        crate::kpanic!("block cache: no buffers");
    }

    fn release(&mut self, handle: BufHandle) {
        let buf = &mut self.bufs[handle.0];
        if buf.refcount == 0 {
            crate::kpanic!("block cache: release of unreferenced buffer");
        }
        buf.refcount -= 1;
        if buf.refcount == 0 {
            self.move_to_front(handle.0);
        }
    }
}

static CACHE: GlobalState<Mutex<Cache>> = GlobalState::new();

/// Construct the fixed buffer pool. Must run once, before any other block
/// cache call.
pub fn init() {
    if CACHE.init(Mutex::new(Cache::new())).is_err() {
        crate::kpanic!("block cache: init called twice");
    }
}

fn with_cache<R>(f: impl FnOnce(&mut Cache) -> R) -> R {
    CACHE
        .with(|mtx| f(&mut mtx.lock()))
        .unwrap_or_else(|| crate::kpanic!("block cache used before init"))
}

/// Acquire a buffer for `(dev, blockno)`, loading neither its validity nor
/// its contents (a cache hit may already be valid).
pub fn get(dev: u32, blockno: u32) -> BufHandle {
    with_cache(|cache| cache.get(dev, blockno))
}

/// Acquire a buffer and ensure its contents are loaded from disk.
pub fn read(dev: u32, blockno: u32) -> BufHandle {
    let handle = get(dev, blockno);
    let needs_load = with_cache(|cache| !cache.bufs[handle.0].valid);
    if needs_load {
        with_cache(|cache| {
            let buf = &mut cache.bufs[handle.0];
            super::blockdev::read_block(blockno, &mut buf.data);
            buf.valid = true;
        });
    }
    handle
}

/// Write a buffer's contents back to disk. Does not release it.
pub fn write(handle: BufHandle) {
    with_cache(|cache| {
        let buf = &cache.bufs[handle.0];
        super::blockdev::write_block(buf.blockno, &buf.data);
    });
}

/// Drop a reference; at zero, the buffer becomes eligible for LRU reuse.
pub fn release(handle: BufHandle) {
    with_cache(|cache| cache.release(handle));
}

/// Bump a buffer's reference count without touching LRU order.
pub fn pin(handle: BufHandle) {
    with_cache(|cache| cache.bufs[handle.0].refcount += 1);
}

/// Inverse of [`pin`]; does not relocate the buffer even at zero.
pub fn unpin(handle: BufHandle) {
    with_cache(|cache| {
        let buf = &mut cache.bufs[handle.0];
        if buf.refcount == 0 {
            crate::kpanic!("block cache: unpin of unreferenced buffer");
        }
        buf.refcount -= 1;
    });
}

/// Run `f` with shared access to a buffer's data.
pub fn with_data<R>(handle: BufHandle, f: impl FnOnce(&[u8; BSIZE]) -> R) -> R {
    with_cache(|cache| f(&cache.bufs[handle.0].data))
}

/// Run `f` with exclusive access to a buffer's data.
pub fn with_data_mut<R>(handle: BufHandle, f: impl FnOnce(&mut [u8; BSIZE]) -> R) -> R {
    with_cache(|cache| f(&mut cache.bufs[handle.0].data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_cache() -> Cache {
        Cache::new()
    }

    #[test]
    fn lru_discipline_reuses_buffer_that_held_first_block() {
        let mut cache = fresh_cache();
        let mut first_handle = None;
        for b in 1..=NBUF as u32 {
            let h = cache.get(1, b);
            if b == 1 {
                first_handle = Some(h);
            }
            cache.release(h);
        }
        let extra = cache.get(1, NBUF as u32 + 1);
        assert_eq!(extra, first_handle.unwrap());
    }

    #[test]
    fn repeated_get_returns_same_slot() {
        let mut cache = fresh_cache();
        let a = cache.get(1, 5);
        cache.release(a);
        let b = cache.get(1, 5);
        assert_eq!(a, b);
    }

}
