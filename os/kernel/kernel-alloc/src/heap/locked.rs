use super::{Heap, HeapError};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_sync::{HeapLockMode, HeapMutex};

/// The kernel heap behind its mode-switching lock.
///
/// Starts out empty so it can live in a `static`; [`init`](Self::init) hands
/// it its window. Until then every allocation fails with
/// [`HeapError::Uninitialized`].
pub struct LockedHeap {
    inner: HeapMutex<Option<Heap>>,
}

impl Default for LockedHeap {
    fn default() -> Self {
        Self::empty()
    }
}

impl LockedHeap {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            inner: HeapMutex::new(None),
        }
    }

    #[must_use]
    pub const fn new(heap: Heap) -> Self {
        Self {
            inner: HeapMutex::new(Some(heap)),
        }
    }

    /// Place the heap over `[base, base + limit)`, replacing any previous one.
    ///
    /// # Errors
    /// As [`Heap::new`].
    ///
    /// # Safety
    /// As [`Heap::new`]. Bodies of a replaced heap become dangling.
    pub unsafe fn init(&self, base: NonNull<u8>, limit: usize) -> Result<(), HeapError> {
        // SAFETY: forwarded to the caller.
        let heap = unsafe { Heap::new(base, limit)? };
        self.inner.with_lock(|slot| *slot = Some(heap));
        Ok(())
    }

    #[must_use]
    pub fn lock_mode(&self) -> HeapLockMode {
        self.inner.raw().mode()
    }

    /// Switch to the yielding semaphore once kernel threads are scheduled.
    pub fn enable_threading(&self) {
        self.inner.raw().enable_threading();
    }

    /// Switch to the cross-core spin lock before secondary cores start.
    pub fn enable_multicore(&self) {
        self.inner.raw().enable_multicore();
    }

    /// Run `f` on the heap under the lock.
    ///
    /// # Errors
    /// [`HeapError::Uninitialized`] before [`init`](Self::init).
    pub fn with_heap<U>(&self, f: impl FnOnce(&mut Heap) -> U) -> Result<U, HeapError> {
        self.inner
            .with_lock(|slot| slot.as_mut().map(f))
            .ok_or(HeapError::Uninitialized)
    }

    /// # Errors
    /// See [`Heap::allocate`].
    pub fn allocate(&self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        self.with_heap(|heap| heap.allocate(bytes))?
    }

    /// # Errors
    /// See [`Heap::zeroed_allocate`].
    pub fn zeroed_allocate(&self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        self.with_heap(|heap| heap.zeroed_allocate(bytes))?
    }

    /// # Errors
    /// See [`Heap::aligned_allocate`].
    pub fn aligned_allocate(&self, alignment: usize, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        self.with_heap(|heap| heap.aligned_allocate(alignment, bytes))?
    }

    /// # Errors
    /// See [`Heap::free`].
    ///
    /// # Safety
    /// See [`Heap::free`].
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        // SAFETY: forwarded to the caller.
        self.with_heap(|heap| unsafe { heap.free(ptr) })?
    }

    /// # Errors
    /// [`HeapError::Uninitialized`], or what [`Heap::sanity_check`] finds.
    pub fn sanity_check(&self) -> Result<(), HeapError> {
        self.with_heap(|heap| heap.sanity_check())?
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.aligned_allocate(layout.align(), layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > super::HEAP_ALIGN {
            // SAFETY: same contract as `alloc`.
            let ptr = unsafe { self.alloc(layout) };
            if !ptr.is_null() {
                // SAFETY: `alloc` returned at least `layout.size()` bytes.
                unsafe { ptr.write_bytes(0, layout.size()) };
            }
            return ptr;
        }
        self.zeroed_allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        // SAFETY: `GlobalAlloc` callers only pass pointers from `alloc`.
        if let Err(err) = unsafe { self.free(ptr) } {
            panic!("heap: dealloc of {ptr:p}: {err}");
        }
    }
}
