use crate::{RawLock, RawUnlock, yield_now};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

pub struct RawSpin {
    held: AtomicBool,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        // Fast path: try once, then spin on a plain load until it looks free.
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Like [`lock`](Self::lock), but calls `relax` after every `spin_limit`
    /// failed polls instead of spinning forever.
    #[inline]
    pub fn lock_bounded(&self, spin_limit: u32, mut relax: impl FnMut()) {
        let mut spins = 0u32;
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spins += 1;
                if spins >= spin_limit {
                    spins = 0;
                    relax();
                } else {
                    spin_loop();
                }
            }
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    /// # Safety
    /// The lock must be held by the caller.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

impl RawLock for RawSpin {
    fn raw_lock(&self) {
        self.lock();
    }

    fn raw_try_lock(&self) -> bool {
        self.try_lock()
    }
}

impl RawUnlock for RawSpin {
    unsafe fn raw_unlock(&self) {
        unsafe { self.unlock() }
    }
}

/// Cross-core spin lock that yields to the scheduler after a bounded spin.
pub struct RawYieldSpin {
    spin: RawSpin,
    spin_limit: u32,
}

impl Default for RawYieldSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawYieldSpin {
    /// Polls before the waiter yields its time slice.
    pub const DEFAULT_SPIN_LIMIT: u32 = 1024;

    #[must_use]
    pub const fn new() -> Self {
        Self::with_spin_limit(Self::DEFAULT_SPIN_LIMIT)
    }

    #[must_use]
    pub const fn with_spin_limit(spin_limit: u32) -> Self {
        Self {
            spin: RawSpin::new(),
            spin_limit: if spin_limit == 0 { 1 } else { spin_limit },
        }
    }
}

impl RawLock for RawYieldSpin {
    fn raw_lock(&self) {
        self.spin.lock_bounded(self.spin_limit, yield_now);
    }

    fn raw_try_lock(&self) -> bool {
        self.spin.try_lock()
    }
}

impl RawUnlock for RawYieldSpin {
    unsafe fn raw_unlock(&self) {
        unsafe { self.spin.unlock() }
    }
}
