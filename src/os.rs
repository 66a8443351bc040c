//! Thin aliases over the platform's synchronization primitives.
//!
//! Short critical sections (bucket arrays, freelists, caches) use spinning
//! locks; anything that needs to wait (journal blocking, interior-update
//! drain, the GC thread's sleep) pairs a sleeping mutex with a condvar, and
//! the long-held reader/writer semaphores (`gc_lock`, `mark_lock`) are the
//! blocking kind.

pub use std::collections::BTreeMap;
pub use std::sync::Arc;
pub use std::sync::Condvar;

pub type Mutex<T> = spin::Mutex<T>;
pub type RwLock<T> = spin::RwLock<T>;

/// Sleeping mutex, for use together with a [`Condvar`].
pub type CvarMutex<T> = std::sync::Mutex<T>;

/// Sleeping reader/writer semaphore.
pub type RwSem<T> = std::sync::RwLock<T>;

pub fn sleep(duration: core::time::Duration) {
    std::thread::sleep(duration);
}
