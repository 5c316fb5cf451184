//! # Kernel Memory Manager
//!
//! One handle over the three memory-management components, passed to the
//! subsystems that need memory instead of reaching for globals:
//!
//! * the kernel heap ([`LockedHeap`]) for kernel objects and page tables,
//! * the user frame pool ([`LockedFramePool`]) for physical frames,
//! * the page table manager ([`AddressSpace`]) for building and switching
//!   address spaces.
//!
//! ## Bring-up
//! ```rust,no_run
//! use kernel_alloc::LockedHeap;
//! use kernel_info::boot::BootMemoryRegion;
//! use kernel_info::memory::MemoryLayout;
//! use kernel_mm::MemoryManager;
//!
//! // In the kernel this static is also the `#[global_allocator]`.
//! static HEAP: LockedHeap = LockedHeap::empty();
//!
//! # fn boot(region: BootMemoryRegion) -> Result<(), kernel_mm::InitError> {
//! let _ = kernel_mm::init_logging(log::LevelFilter::Info);
//! let mm = unsafe { MemoryManager::new(&HEAP, MemoryLayout::DEFAULT, region)? };
//! let _root = mm.create_address_space()?;
//! # Ok(())
//! # }
//! ```
//!
//! The heap lock starts in boot mode (no locking). Call
//! [`MemoryManager::enable_threading`] once the scheduler runs kernel threads
//! and [`MemoryManager::enable_multicore`] before secondary cores start.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_alloc::{BuddyError, HeapError, HeapTableAlloc, LockedFramePool, LockedHeap, OffsetPhysMapper};
use kernel_info::boot::BootMemoryRegion;
use kernel_info::memory::MemoryLayout;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use kernel_qemu::QemuLogger;
use kernel_registers::RegisterAccess;
use kernel_vmem::{AddressSpace, MapError, MappingFlags};
use log::{LevelFilter, SetLoggerError, info};

/// Physical address of a root (level-3) page table.
pub type PageTableRoot = PhysicalAddress;

static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Trace);

/// Route `log` output to the QEMU debug console, filtered at `max_level`.
///
/// # Errors
/// If a logger is already installed.
pub fn init_logging(max_level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.init()?;
    log::set_max_level(max_level);
    Ok(())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("heap setup failed: {0}")]
    Heap(#[from] HeapError),
    #[error("frame pool setup failed: {0}")]
    Frames(#[from] BuddyError),
    #[error("page table setup failed: {0}")]
    Map(#[from] MapError),
    /// Page tables come from the heap, so the heap has to be reachable
    /// through the direct map.
    #[error("heap base {0} is not inside the direct map")]
    HeapOutsideDirectMap(VirtualAddress),
}

pub struct MemoryManager<'h> {
    layout: MemoryLayout,
    heap: &'h LockedHeap,
    frames: LockedFramePool,
    mapper: OffsetPhysMapper,
    page_tables: AtomicUsize,
}

impl<'h> MemoryManager<'h> {
    /// Bring up the heap over `layout`'s window and a frame pool over
    /// `region`.
    ///
    /// # Errors
    /// [`InitError::HeapOutsideDirectMap`] if the heap cannot back page
    /// tables, otherwise whatever [`LockedHeap::init`] reports.
    ///
    /// # Safety
    /// The heap window must be mapped, writable and used by nothing else.
    /// `region` must describe physical memory owned by the frame pool alone.
    pub unsafe fn new(
        heap: &'h LockedHeap,
        layout: MemoryLayout,
        region: BootMemoryRegion,
    ) -> Result<Self, InitError> {
        let mapper = OffsetPhysMapper::new(layout.phys_offset);
        let base = layout.heap_base;
        if mapper.virt_to_phys(base).is_none() {
            return Err(InitError::HeapOutsideDirectMap(base));
        }
        let window = NonNull::new(base.as_mut_ptr::<u8>()).ok_or(InitError::HeapOutsideDirectMap(base))?;
        let limit = usize::try_from(layout.heap_limit)
            .map_err(|_| HeapError::RegionTooLarge(usize::MAX))?;

        // SAFETY: forwarded to the caller.
        unsafe { heap.init(window, limit)? };
        info!(
            "mm: heap at {base}, limit {limit:#x}; frames {}..{}",
            region.start(),
            region.end()
        );

        Ok(Self {
            layout,
            heap,
            frames: LockedFramePool::new(region),
            mapper,
            page_tables: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    #[must_use]
    pub const fn heap(&self) -> &'h LockedHeap {
        self.heap
    }

    #[must_use]
    pub const fn frames(&self) -> &LockedFramePool {
        &self.frames
    }

    #[must_use]
    pub const fn mapper(&self) -> &OffsetPhysMapper {
        &self.mapper
    }

    /// Page tables created through this manager so far.
    #[must_use]
    pub fn page_table_count(&self) -> usize {
        self.page_tables.load(Ordering::Relaxed)
    }

    pub fn enable_threading(&self) {
        self.heap.enable_threading();
    }

    pub fn enable_multicore(&self) {
        self.heap.enable_multicore();
    }

    /// # Errors
    /// See [`kernel_alloc::Heap::allocate`].
    pub fn allocate(&self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.allocate(bytes)
    }

    /// # Errors
    /// See [`kernel_alloc::Heap::zeroed_allocate`].
    pub fn zeroed_allocate(&self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.zeroed_allocate(bytes)
    }

    /// # Errors
    /// See [`kernel_alloc::Heap::aligned_allocate`].
    pub fn aligned_allocate(&self, alignment: usize, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.aligned_allocate(alignment, bytes)
    }

    /// # Errors
    /// See [`kernel_alloc::Heap::free`].
    ///
    /// # Safety
    /// `ptr` must come from this manager's heap and must not be used again.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        // SAFETY: forwarded to the caller.
        unsafe { self.heap.free(ptr) }
    }

    /// # Errors
    /// See [`kernel_alloc::FramePool::allocate_frame`].
    pub fn allocate_frame(&self, order: u8) -> Result<PhysicalAddress, BuddyError> {
        self.frames.allocate_frame(order)
    }

    /// # Errors
    /// See [`kernel_alloc::FramePool::free_frame`].
    pub fn free_frame(&self, pa: PhysicalAddress) -> Result<(), BuddyError> {
        self.frames.free_frame(pa)
    }

    /// A new, empty address space.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the heap cannot hold the root table.
    pub fn create_address_space(&self) -> Result<PageTableRoot, MapError> {
        let mut alloc = self.table_alloc();
        let aspace = AddressSpace::create(&self.mapper, &mut alloc);
        self.page_tables.fetch_add(alloc.allocated, Ordering::Relaxed);
        Ok(aspace?.root())
    }

    /// Map `[va, va + size)` onto `[pa, pa + size)` with 4 KiB pages in the
    /// address space rooted at `root`.
    ///
    /// Mapping into one root must not run concurrently with other mapping
    /// or translation on the same root.
    ///
    /// # Errors
    /// See [`AddressSpace::map_range`].
    ///
    /// # Panics
    /// If `root`, `va`, `pa` or `size` is not 4 KiB aligned.
    pub fn map_range(
        &self,
        root: PageTableRoot,
        va: VirtualAddress,
        size: u64,
        pa: PhysicalAddress,
        writable: bool,
        user: bool,
    ) -> Result<(), MapError> {
        self.map_range_with::<Size4K>(root, va, size, pa, MappingFlags::new(writable, user))
    }

    /// Like [`map_range`](Self::map_range) with pages of size `S`.
    ///
    /// # Errors
    /// See [`AddressSpace::map_range_with`].
    ///
    /// # Panics
    /// If `root` is not 4 KiB aligned or `va`, `pa`, `size` are not aligned
    /// to `S`.
    pub fn map_range_with<S: PageSize>(
        &self,
        root: PageTableRoot,
        va: VirtualAddress,
        size: u64,
        pa: PhysicalAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        let aspace = AddressSpace::from_root(&self.mapper, root);
        let mut alloc = self.table_alloc();
        let result = aspace.map_range_with::<S, _>(&mut alloc, va, size, pa, flags);
        self.page_tables.fetch_add(alloc.allocated, Ordering::Relaxed);
        result
    }

    /// Software walk of the address space rooted at `root`.
    ///
    /// # Panics
    /// If `root` is not 4 KiB aligned.
    #[must_use]
    pub fn translate(&self, root: PageTableRoot, va: VirtualAddress) -> Option<PhysicalAddress> {
        AddressSpace::from_root(&self.mapper, root).translate(va)
    }

    /// Switch the CPU to the address space rooted at `root`.
    ///
    /// # Safety
    /// The address space must map the executing code, its stack and the
    /// direct map.
    pub unsafe fn activate<R: RegisterAccess>(&self, root: PageTableRoot, regs: &R) {
        // SAFETY: forwarded to the caller.
        unsafe { AddressSpace::from_root(&self.mapper, root).activate(regs) };
    }

    /// Root of the currently active address space.
    ///
    /// # Safety
    /// CR3 must hold a root table reachable through the direct map.
    pub unsafe fn current_root<R: RegisterAccess>(&self, regs: &R) -> PageTableRoot {
        // SAFETY: forwarded to the caller.
        unsafe { AddressSpace::from_current(&self.mapper, regs).root() }
    }

    const fn table_alloc(&self) -> HeapTableAlloc<'h> {
        HeapTableAlloc::new(self.heap, self.mapper)
    }
}
