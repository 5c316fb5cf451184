//! # Kernel heap lock
//!
//! The heap is used from the very first instructions of the kernel, long
//! before a scheduler or secondary cores exist. Its lock therefore changes
//! behavior as the system comes up:
//!
//! | Mode | Acquire | Contention |
//! |------|---------|------------|
//! | [`HeapLockMode::Boot`] | no-op | impossible, single thread |
//! | [`HeapLockMode::Threaded`] | binary semaphore | waiter yields via [`yield_now`] |
//! | [`HeapLockMode::MultiCore`] | cross-core spin | bounded spin, then [`yield_now`] |
//!
//! Modes only move forward. Switch modes while no heap operation is in flight.

use crate::{RawLock, RawUnlock, yield_now};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeapLockMode {
    /// Single-threaded boot; locking is a no-op.
    Boot = 0,
    /// Cooperative kernel threads on one core; waiters sleep.
    Threaded = 1,
    /// Several cores are running; waiters spin.
    MultiCore = 2,
}

impl HeapLockMode {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Boot,
            1 => Self::Threaded,
            _ => Self::MultiCore,
        }
    }
}

pub struct RawHeapLock {
    mode: AtomicU8,
    /// Semaphore count; `1` when the lock is free.
    permits: AtomicU32,
}

impl Default for RawHeapLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawHeapLock {
    /// Polls before a multi-core waiter yields its time slice.
    const SPIN_LIMIT: u32 = 1024;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            mode: AtomicU8::new(HeapLockMode::Boot as u8),
            permits: AtomicU32::new(1),
        }
    }

    #[inline]
    pub fn mode(&self) -> HeapLockMode {
        HeapLockMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Called once the scheduler runs kernel threads.
    pub fn enable_threading(&self) {
        self.advance(HeapLockMode::Threaded);
    }

    /// Called before secondary cores are started.
    pub fn enable_multicore(&self) {
        self.advance(HeapLockMode::MultiCore);
    }

    fn advance(&self, to: HeapLockMode) {
        self.mode.fetch_max(to as u8, Ordering::AcqRel);
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.permits
            .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl RawLock for RawHeapLock {
    fn raw_lock(&self) {
        match self.mode() {
            HeapLockMode::Boot => {}
            HeapLockMode::Threaded => {
                while !self.try_acquire() {
                    yield_now();
                }
            }
            HeapLockMode::MultiCore => {
                let mut spins = 0u32;
                while !self.try_acquire() {
                    while self.permits.load(Ordering::Relaxed) == 0 {
                        spins += 1;
                        if spins >= Self::SPIN_LIMIT {
                            spins = 0;
                            yield_now();
                        } else {
                            spin_loop();
                        }
                    }
                }
            }
        }
    }

    fn raw_try_lock(&self) -> bool {
        match self.mode() {
            HeapLockMode::Boot => true,
            HeapLockMode::Threaded | HeapLockMode::MultiCore => self.try_acquire(),
        }
    }
}

impl RawUnlock for RawHeapLock {
    unsafe fn raw_unlock(&self) {
        if self.mode() != HeapLockMode::Boot {
            self.permits.store(1, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_mode_never_blocks() {
        let l = RawHeapLock::new();
        assert_eq!(l.mode(), HeapLockMode::Boot);
        l.raw_lock();
        assert!(l.raw_try_lock());
        unsafe { l.raw_unlock() };
    }

    #[test]
    fn modes_only_advance() {
        let l = RawHeapLock::new();
        l.enable_multicore();
        l.enable_threading();
        assert_eq!(l.mode(), HeapLockMode::MultiCore);
    }

    #[test]
    fn threaded_mode_is_exclusive() {
        let l = RawHeapLock::new();
        l.enable_threading();
        l.raw_lock();
        assert!(!l.raw_try_lock());
        unsafe { l.raw_unlock() };
        assert!(l.raw_try_lock());
        unsafe { l.raw_unlock() };
    }
}
