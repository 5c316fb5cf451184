#![allow(dead_code)]

use core::ptr::NonNull;
use kernel_alloc::heap::{Heap, LockedHeap};

#[derive(Clone, Copy)]
#[repr(C, align(4096))]
pub struct Page([u8; 4096]);

/// Page-aligned memory for a test heap.
pub struct Arena {
    pages: Vec<Page>,
}

impl Arena {
    pub fn new(bytes: usize) -> Self {
        Self {
            pages: vec![Page([0; 4096]); bytes.div_ceil(4096)],
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len() * 4096
    }

    pub fn base(&mut self) -> NonNull<u8> {
        NonNull::new(self.pages.as_mut_ptr().cast::<u8>()).unwrap()
    }

    pub fn heap(&mut self) -> Heap {
        let len = self.len();
        unsafe { Heap::new(self.base(), len) }.unwrap()
    }

    pub fn locked_heap(&mut self) -> LockedHeap {
        LockedHeap::new(self.heap())
    }
}
