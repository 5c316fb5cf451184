//! Scheduler yield hook.
//!
//! The scheduler is not part of this crate; it registers a function that gives
//! up the current thread's time slice. Until one is installed, yielding
//! degrades to a CPU spin hint.

use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

static YIELD_HOOK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Register the scheduler's yield function. Replaces any previous hook.
pub fn install_yield_hook(hook: fn()) {
    YIELD_HOOK.store(hook as *mut (), Ordering::Release);
}

/// Give up the CPU to other runnable work.
#[inline]
pub fn yield_now() {
    let hook = YIELD_HOOK.load(Ordering::Acquire);
    if hook.is_null() {
        spin_loop();
    } else {
        // SAFETY: only `install_yield_hook` stores into YIELD_HOOK, always from a `fn()`.
        let hook = unsafe { core::mem::transmute::<*mut (), fn()>(hook) };
        hook();
    }
}
