//! Page table storage carved from the kernel heap.

use crate::heap::LockedHeap;
use crate::phys_mapper::OffsetPhysMapper;
use core::mem::{align_of, size_of};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{PageTable, TableAlloc};
use log::warn;

/// [`TableAlloc`] that takes page-aligned bodies from a [`LockedHeap`].
///
/// The heap must live inside the linear map described by `mapper`, so a body
/// address converts back to the physical address the table entries need.
/// Tables are never returned to the heap.
pub struct HeapTableAlloc<'h> {
    heap: &'h LockedHeap,
    mapper: OffsetPhysMapper,
    /// Tables handed out so far.
    pub allocated: usize,
}

impl<'h> HeapTableAlloc<'h> {
    #[must_use]
    pub const fn new(heap: &'h LockedHeap, mapper: OffsetPhysMapper) -> Self {
        Self {
            heap,
            mapper,
            allocated: 0,
        }
    }
}

impl TableAlloc for HeapTableAlloc<'_> {
    fn alloc_table(&mut self) -> Option<PhysicalAddress> {
        let body = match self.heap.aligned_allocate(align_of::<PageTable>(), size_of::<PageTable>()) {
            Ok(body) => body,
            Err(err) => {
                warn!("page table allocation failed: {err}");
                return None;
            }
        };
        let va = VirtualAddress::from_nonnull(body);
        let Some(pa) = self.mapper.virt_to_phys(va) else {
            warn!("page table at {va} is outside the direct map");
            // SAFETY: `body` was allocated above and never handed out.
            let _ = unsafe { self.heap.free(body) };
            return None;
        };
        self.allocated += 1;
        Some(pa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;

    #[derive(Clone, Copy)]
    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    #[test]
    fn tables_are_page_aligned_heap_bodies() {
        let mut pages = vec![Page([0; 4096]); 8];
        let heap = LockedHeap::empty();
        let base = NonNull::new(pages.as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { heap.init(base, pages.len() * 4096) }.unwrap();

        let mut alloc = HeapTableAlloc::new(&heap, OffsetPhysMapper::identity());
        let a = alloc.alloc_table().unwrap();
        let b = alloc.alloc_table().unwrap();
        assert!(a.is_aligned_to(4096) && b.is_aligned_to(4096));
        assert_ne!(a, b);
        assert_eq!(alloc.allocated, 2);
        heap.sanity_check().unwrap();
    }

    #[test]
    fn exhaustion_yields_none() {
        let mut pages = vec![Page([0; 4096]); 2];
        let heap = LockedHeap::empty();
        let base = NonNull::new(pages.as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { heap.init(base, pages.len() * 4096) }.unwrap();

        let mut alloc = HeapTableAlloc::new(&heap, OffsetPhysMapper::identity());
        assert_eq!(alloc.alloc_table(), None);
        assert_eq!(alloc.allocated, 0);
    }

    #[test]
    fn unmappable_tables_go_back_to_the_heap() {
        let mut pages = vec![Page([0; 4096]); 4];
        let heap = LockedHeap::empty();
        let base = NonNull::new(pages.as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { heap.init(base, pages.len() * 4096) }.unwrap();

        let mut alloc = HeapTableAlloc::new(&heap, OffsetPhysMapper::new(u64::MAX));
        assert_eq!(alloc.alloc_table(), None);
        assert_eq!(alloc.allocated, 0);
        assert_eq!(heap.with_heap(|h| h.current_size()).unwrap(), 4);
        assert_eq!(heap.with_heap(|h| h.free_chunk_count()).unwrap(), 0);
        heap.sanity_check().unwrap();
    }
}
