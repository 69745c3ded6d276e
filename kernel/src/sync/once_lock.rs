//! Safe global initialization for the kernel's process-lifetime singletons.
//!
//! The frame allocator, block cache, inode table, file table, ready queue,
//! superblock, and PLIC driver are each a `static GlobalState<Mutex<T>>`
//! initialized exactly once during the boot sequence (§9). The cooperative,
//! single-hart scheduling model (§5) means these are never actually
//! contended, but `static` still demands `Send`/`Sync`, so a lock is the
//! vocabulary the type system requires.

use spin::Mutex;

/// A `static`-friendly cell holding a value set exactly once after boot.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    /// Create new uninitialized global state.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize the global state. Returns the value back as `Err` if
    /// already initialized.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut lock = self.inner.lock();
        if lock.is_some() {
            Err(value)
        } else {
            *lock = Some(value);
            Ok(())
        }
    }

    /// Run a closure with a shared reference to the contained value.
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        let lock = self.inner.lock();
        lock.as_ref().map(f)
    }

    /// Run a closure with an exclusive reference to the contained value.
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        let mut lock = self.inner.lock();
        lock.as_mut().map(f)
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: GlobalState<T> can be sent across threads if T: Send. The inner
// spin::Mutex provides mutual exclusion, so the contained Option<T> is only
// accessed by one thread at a time.
unsafe impl<T: Send> Send for GlobalState<T> {}
// SAFETY: GlobalState<T> can be shared across threads if T: Send. The
// spin::Mutex serializes all access to the inner Option<T>.
unsafe impl<T: Send> Sync for GlobalState<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_once_then_rejects() {
        let state: GlobalState<u32> = GlobalState::new();
        assert!(state.init(7).is_ok());
        assert_eq!(state.init(8), Err(8));
        assert_eq!(state.with(|v| *v), Some(7));
    }

    #[test]
    fn with_mut_updates_in_place() {
        let state: GlobalState<u32> = GlobalState::new();
        state.init(1).unwrap();
        state.with_mut(|v| *v += 41);
        assert_eq!(state.with(|v| *v), Some(42));
    }
}
