//! # Kernel synchronization primitives
//!
//! A generic [`Mutex`] over pluggable raw locks:
//!
//! * [`RawSpin`]: test-and-test-and-set spin lock.
//! * [`RawYieldSpin`]: spins a bounded number of times, then yields the
//!   calling thread to the scheduler through the [yield hook](install_yield_hook).
//!   Guards the physical frame pool.
//! * [`RawHeapLock`]: the kernel heap lock. A no-op during single-threaded
//!   boot, a yielding binary semaphore once threading is up, and a cross-core
//!   spin lock once secondary cores run.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_heap_lock;
mod raw_spin;
mod yield_hook;

pub use mutex::{Mutex, MutexGuard};
pub use raw_heap_lock::{HeapLockMode, RawHeapLock};
pub use raw_spin::{RawSpin, RawYieldSpin};
pub use yield_hook::{install_yield_hook, yield_now};

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type YieldSpinMutex<T> = Mutex<T, RawYieldSpin>;
pub type HeapMutex<T> = Mutex<T, RawHeapLock>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> YieldSpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawYieldSpin::new(), value)
    }
}

impl<T> HeapMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawHeapLock::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The lock must be held by the caller.
    unsafe fn raw_unlock(&self);
}
