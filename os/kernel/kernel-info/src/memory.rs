//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};

/// End of userspace VA range after which Kernel space begins.
pub const USERSPACE_END: u64 = 0xffff_0000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Physical address backing the first byte of the kernel heap.
pub const KERNEL_HEAP_PHYS: u64 = 0x0400_0000;

/// Start of the kernel heap window.
///
/// The heap lives inside the direct map, so a heap pointer converts to its
/// physical address by subtracting [`HHDM_BASE`]. Page tables carved from
/// the heap rely on this.
pub const KERNEL_HEAP_BASE: u64 = HHDM_BASE + KERNEL_HEAP_PHYS;

/// Maximum extent of the kernel heap in bytes.
///
/// Chunk sizes are 31-bit values, so the heap never exceeds 1 GiB.
pub const KERNEL_HEAP_LIMIT: u64 = 1 << 30;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Size of one physical frame.
pub const FRAME_SIZE: u64 = Size4K::SIZE;

/// log2 of [`FRAME_SIZE`].
pub const FRAME_SHIFT: u32 = Size4K::SHIFT;

/// Top buddy order of one user frame pool instance.
pub const USER_POOL_ORDER: u8 = 13;

/// Bytes covered by one user frame pool instance (32 MiB).
pub const USER_POOL_SPAN: u64 = FRAME_SIZE << USER_POOL_ORDER;

/// Number of segregated free-list buckets in the kernel heap.
pub const HEAP_NUM_BUCKETS: usize = 16;

const _: () = {
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNEL_HEAP_BASE > HHDM_BASE);
    assert!(KERNEL_HEAP_BASE.is_multiple_of(FRAME_SIZE));
    assert!(KERNEL_BASE > KERNEL_HEAP_BASE + KERNEL_HEAP_LIMIT);
    assert!(KERNEL_HEAP_LIMIT <= 1 << 30);
    assert!(USER_POOL_SPAN == 32 * 1024 * 1024);
};

/// Runtime view of the memory layout handed to the memory manager.
///
/// The kernel uses [`MemoryLayout::DEFAULT`]; host tests build layouts over
/// their own buffers with a zero physical offset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    /// First byte of the heap window. Must be 8-byte aligned.
    pub heap_base: VirtualAddress,
    /// Maximum heap extent in bytes.
    pub heap_limit: u64,
    /// Offset added to a physical address to reach it through the direct map.
    pub phys_offset: u64,
}

impl MemoryLayout {
    /// Kernel layout built from the constants above.
    pub const DEFAULT: Self = Self {
        heap_base: VirtualAddress::new(KERNEL_HEAP_BASE),
        heap_limit: KERNEL_HEAP_LIMIT,
        phys_offset: HHDM_BASE,
    };

    /// Layout for a heap placed at `heap_base` with identity physical mapping.
    #[must_use]
    pub const fn identity(heap_base: VirtualAddress, heap_limit: u64) -> Self {
        Self {
            heap_base,
            heap_limit,
            phys_offset: 0,
        }
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
