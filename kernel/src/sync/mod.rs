//! Synchronization primitives.

pub mod once_lock;

pub use once_lock::GlobalState;
